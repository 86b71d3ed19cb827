//! Inbound webhook intake (§4.G, §4.F) — validates the envelope and hands
//! off to the queue consumer. The actual per-event-type logic lives in
//! [`crate::webhook`], driven by the queue's worker pool, not this route.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::BrokerError;
use crate::queue::QueueMessage;
use crate::state::AppState;

use super::ok_envelope;

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub delivery_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// `POST /api/v1/webhooks`
pub async fn receive(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> Result<Json<Value>, BrokerError> {
    state.queue.submit(QueueMessage {
        delivery_id: envelope.delivery_id.clone(),
        event_type: envelope.event_type,
        payload: envelope.payload,
    })?;

    Ok(Json(ok_envelope(serde_json::json!({
        "deliveryId": envelope.delivery_id,
        "accepted": true,
    }))))
}
