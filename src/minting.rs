//! Client for the external identifier-minting service (out of scope per §1;
//! only the contract this broker consumes is specified here, §6).

use serde::{Deserialize, Serialize};

use crate::identifiers;

#[derive(Debug, Serialize)]
struct MintRequest<'a> {
    entity_type: char,
    characterization: &'a str,
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    chitty_id: String,
}

#[derive(Clone)]
pub struct MintingClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MintingClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self { http, base_url, token }
    }

    /// Mint a canonical identifier for a synthetic-person context entity
    /// (§4.D `createContext`: `entityType=Person`, `characterization=Synthetic`).
    /// `lifecycle` carries the lifecycle tag for derivative operations
    /// (supernova/fission/derivative/suspension), `None` for ordinary creation.
    pub async fn mint_context_id(&self, lifecycle: Option<&str>) -> anyhow::Result<String> {
        let mut metadata = serde_json::json!({});
        if let Some(lifecycle) = lifecycle {
            metadata["lifecycle"] = serde_json::json!(lifecycle);
        }

        let request = MintRequest {
            entity_type: identifiers::ENTITY_TYPE_PERSON,
            characterization: "Synthetic",
            metadata,
        };

        let response = self
            .http
            .post(format!("{}/mint", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("minting service returned {}", response.status());
        }

        let body: MintResponse = response.json().await?;
        identifiers::validate(&body.chitty_id)?;
        Ok(body.chitty_id)
    }
}
