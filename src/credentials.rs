//! Credential Broker (§4.C) — retrieves, caches, and provisions short-lived
//! credentials from the external vault, with fallback to environment
//! secrets and a full provisioning audit trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{BrokerError, ErrorKind};
use crate::gateway::{CallOptions, OutboundGateway};
use crate::models::CredentialAuditEntry;

/// Vault path convention (§4.C): `services/{service}/service_token`.
fn vault_token_path(service: &str) -> String {
    format!("services/{service}/service_token")
}

/// Conventional environment-variable fallback (§4.C, §8 scenario 6):
/// `CHITTY_{SERVICE}_TOKEN`.
fn env_fallback_var(service: &str) -> String {
    format!("CHITTY_{}_TOKEN", service.to_uppercase())
}

#[derive(Debug, Deserialize)]
struct VaultTokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct VaultProvisionResponse {
    token_id: String,
    secret: String,
    expires_at: DateTime<Utc>,
}

pub struct CredentialBroker {
    db: PgPool,
    gateway: Arc<OutboundGateway>,
    /// Values are AES-256-GCM ciphertext (`at_rest::encrypt`) whenever
    /// `encryption_key_material` is configured (§4.C), never the raw token.
    cache: Cache<String, Arc<str>>,
    vault_addr: String,
    vault_token: String,
    encryption_key_material: Option<String>,
}

impl CredentialBroker {
    pub fn new(db: PgPool, gateway: Arc<OutboundGateway>, config: &Config) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.credential_cache_max_entries)
            .time_to_live(config.credential_cache_ttl)
            .build();
        Self {
            db,
            gateway,
            cache,
            vault_addr: config.vault_addr.clone(),
            vault_token: config.vault_token.clone(),
            encryption_key_material: config.encryption_key_material.clone(),
        }
    }

    /// Encrypts `token` at rest (§4.C) before caching it, when a key is
    /// configured; without one, logs a warning and caches plaintext rather
    /// than refusing to serve a token cache never fails CONFIG_UNAVAILABLE.
    fn cache_insert(&self, service: &str, token: &str) {
        let stored = match &self.encryption_key_material {
            Some(key) => match at_rest::encrypt(token, key) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    tracing::warn!(service, error = %e, "credentials: at-rest encryption failed, caching plaintext");
                    token.to_string()
                }
            },
            None => {
                tracing::warn!(service, "credentials: no CHITTY_ENCRYPTION_KEY configured, caching plaintext");
                token.to_string()
            }
        };
        self.cache.insert(service.to_string(), Arc::from(stored.as_str()));
    }

    /// Decrypts a cache hit (§4.C); transparently accepts legacy plaintext
    /// entries via `at_rest::decrypt`'s unversioned-prefix passthrough.
    fn cache_get(&self, service: &str) -> Option<Result<String, BrokerError>> {
        let stored = self.cache.get(service)?;
        match &self.encryption_key_material {
            Some(key) => Some(
                at_rest::decrypt(&stored, key)
                    .map_err(|e| BrokerError::new(ErrorKind::Server, format!("credential cache decrypt failed: {e}"))),
            ),
            None => Some(Ok(stored.to_string())),
        }
    }

    /// Approximate occupancy of the in-memory credential cache, for the
    /// `/metrics` diagnostic surface (§10.5). `moka` counts are eventually
    /// consistent with pending internal maintenance.
    pub fn cache_len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// `getServiceToken(service)` (§4.C). Cache → vault → env fallback.
    /// Vault failures are logged, not surfaced, as long as an env fallback
    /// exists (§4.C failure semantics).
    pub async fn get_service_token(&self, service: &str) -> Result<String, BrokerError> {
        if let Some(cached) = self.cache_get(service) {
            tracing::debug!(service, "credentials: cache hit");
            return cached;
        }

        match self.fetch_from_vault(service).await {
            Ok(token) => {
                self.cache_insert(service, &token);
                self.record_outcome(service, "service_token", "vault_hit").await;
                return Ok(token);
            }
            Err(e) => {
                tracing::warn!(service, error = %e, "credentials: vault lookup failed, trying env fallback");
            }
        }

        let var = env_fallback_var(service);
        match std::env::var(&var) {
            Ok(token) => {
                self.cache_insert(service, &token);
                self.record_outcome(service, "service_token", "fallback_used").await;
                Ok(token)
            }
            Err(_) => {
                self.record_outcome(service, "service_token", "unavailable").await;
                Err(BrokerError::config_unavailable(format!(
                    "no vault token and no {var} environment fallback for service '{service}'"
                )))
            }
        }
    }

    async fn fetch_from_vault(&self, service: &str) -> Result<String, BrokerError> {
        let url = format!("{}/v1/{}", self.vault_addr.trim_end_matches('/'), vault_token_path(service));
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Vault-Token",
            reqwest::header::HeaderValue::from_str(&self.vault_token)
                .map_err(|e| BrokerError::new(ErrorKind::ConfigUnavailable, e.to_string()))?,
        );
        let resp = self
            .gateway
            .call("vault", &url, CallOptions { method: reqwest::Method::GET, headers, body: None })
            .await?;
        let parsed: VaultTokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| BrokerError::new(ErrorKind::Server, format!("malformed vault response: {e}")))?;
        Ok(parsed.token)
    }

    /// `provision(type, context, ttlHours)` (§4.C). Returns the secret
    /// exactly once; only the audit row is persisted, never the secret.
    pub async fn provision(
        &self,
        kind: &str,
        context_id: Uuid,
        requesting_service: &str,
        ttl_hours: i64,
    ) -> Result<(String, String, DateTime<Utc>), BrokerError> {
        let url = format!("{}/v1/chitty-broker/provision", self.vault_addr.trim_end_matches('/'));
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Vault-Token",
            reqwest::header::HeaderValue::from_str(&self.vault_token)
                .map_err(|e| BrokerError::new(ErrorKind::ConfigUnavailable, e.to_string()))?,
        );
        let body = serde_json::to_vec(&json!({
            "type": kind,
            "context_id": context_id,
            "ttl_hours": ttl_hours,
        }))
        .map_err(|e| BrokerError::new(ErrorKind::Server, e.to_string()))?;

        let resp = self
            .gateway
            .call("vault", &url, CallOptions { method: reqwest::Method::POST, headers, body: Some(body) })
            .await?;
        let parsed: VaultProvisionResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| BrokerError::new(ErrorKind::Server, format!("malformed vault provision response: {e}")))?;

        sqlx::query(
            "INSERT INTO credential_audit_entries \
             (id, type, service, requesting_service, token_id, expires_at, revoked_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NULL, now())",
        )
        .bind(Uuid::new_v4())
        .bind(kind)
        .bind(requesting_service)
        .bind(requesting_service)
        .bind(&parsed.token_id)
        .bind(parsed.expires_at)
        .execute(&self.db)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        Ok((parsed.token_id, parsed.secret, parsed.expires_at))
    }

    /// `validate(type, tokenId, checkPermissions?)` (§4.C, §8 P6).
    pub async fn validate(&self, token_id: &str) -> Result<&'static str, BrokerError> {
        let row: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT expires_at, revoked_at FROM credential_audit_entries WHERE token_id = $1",
        )
        .bind(token_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        match row {
            None => Err(BrokerError::not_found(format!("unknown token_id '{token_id}'"))),
            Some((_, Some(_))) => Ok("revoked"),
            Some((Some(expires_at), None)) if expires_at <= Utc::now() => Ok("expired"),
            Some((_, None)) => Ok("active"),
        }
    }

    /// `revoke(tokenId, reason)` (§4.C). Best-effort upstream revocation —
    /// the local audit mark always succeeds regardless of vault reachability.
    pub async fn revoke(&self, token_id: &str, reason: &str) -> Result<(), BrokerError> {
        let result = sqlx::query(
            "UPDATE credential_audit_entries SET revoked_at = now() WHERE token_id = $1 AND revoked_at IS NULL",
        )
        .bind(token_id)
        .execute(&self.db)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::not_found(format!("no active credential with token_id '{token_id}'")));
        }

        let url = format!("{}/v1/chitty-broker/revoke/{}", self.vault_addr.trim_end_matches('/'), token_id);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Vault-Token",
            reqwest::header::HeaderValue::from_str(&self.vault_token).unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        if let Err(e) = self
            .gateway
            .call("vault", &url, CallOptions {
                method: reqwest::Method::POST,
                headers,
                body: Some(json!({ "reason": reason }).to_string().into_bytes()),
            })
            .await
        {
            tracing::warn!(token_id, error = %e, "credentials: upstream revoke failed, local audit mark stands");
        }

        Ok(())
    }

    /// `audit(filter, limit)` (§4.C).
    pub async fn audit(&self, service: Option<&str>, limit: i64) -> Result<Vec<CredentialAuditEntry>, BrokerError> {
        let rows = match service {
            Some(service) => {
                sqlx::query_as::<_, CredentialAuditEntry>(
                    "SELECT id, type, service, requesting_service, token_id, expires_at, revoked_at, created_at \
                     FROM credential_audit_entries WHERE service = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(service)
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
            None => {
                sqlx::query_as::<_, CredentialAuditEntry>(
                    "SELECT id, type, service, requesting_service, token_id, expires_at, revoked_at, created_at \
                     FROM credential_audit_entries ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
        }
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        Ok(rows)
    }

    async fn record_outcome(&self, service: &str, kind: &str, outcome: &str) {
        if let Err(e) = sqlx::query(
            "INSERT INTO credential_audit_entries (id, type, service, requesting_service, token_id, expires_at, revoked_at, created_at) \
             VALUES ($1, $2, $3, $4, NULL, NULL, NULL, now())",
        )
        .bind(Uuid::new_v4())
        .bind(format!("{kind}:{outcome}"))
        .bind(service)
        .bind("self")
        .execute(&self.db)
        .await
        {
            tracing::warn!(service, outcome, error = %e, "credentials: failed to record audit outcome");
        }
    }
}

/// AES-256-GCM helpers for secrets at rest (§4.C). Ciphertext carries a
/// versioned prefix (`v1:`) so a legacy-plaintext migration window can be
/// supported without a schema change.
pub mod at_rest {
    use aes_gcm::aead::{Aead, KeyInit, OsRng};
    use aes_gcm::{Aes256Gcm, Nonce};
    use rand::RngCore;

    const PREFIX: &str = "v1:";

    fn key_from_material(material: &str) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        hasher.finalize().into()
    }

    pub fn encrypt(plaintext: &str, key_material: &str) -> anyhow::Result<String> {
        let key = key_from_material(key_material);
        let cipher = Aes256Gcm::new_from_slice(&key)?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", hex::encode(combined)))
    }

    pub fn decrypt(stored: &str, key_material: &str) -> anyhow::Result<String> {
        let Some(hex_body) = stored.strip_prefix(PREFIX) else {
            // Legacy plaintext during a migration window (§4.C).
            return Ok(stored.to_string());
        };
        let key = key_from_material(key_material);
        let cipher = Aes256Gcm::new_from_slice(&key)?;
        let combined = hex::decode(hex_body)?;
        if combined.len() < 12 {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed"))?;
        Ok(String::from_utf8(plaintext)?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips() {
            let ct = encrypt("super-secret-token", "key-material").unwrap();
            assert!(ct.starts_with(PREFIX));
            assert_eq!(decrypt(&ct, "key-material").unwrap(), "super-secret-token");
        }

        #[test]
        fn legacy_plaintext_passes_through() {
            assert_eq!(decrypt("plain-old-token", "key-material").unwrap(), "plain-old-token");
        }
    }
}
