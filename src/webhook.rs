//! Webhook/sync event processing (§4.G). The HTTP route in
//! [`crate::handlers::webhook`] only validates and enqueues; this module
//! holds the actual per-event-type business logic the queue consumer drives.

use std::sync::Arc;

use serde::Deserialize;

use crate::credentials::CredentialBroker;
use crate::error::BrokerError;
use crate::models::{SessionMetrics, UnbindReason};
use crate::queue::{EventHandler, QueueMessage};
use crate::resolver::ContextResolver;

#[derive(Debug, Deserialize)]
struct SessionUnboundPayload {
    session_id: String,
    #[serde(flatten)]
    metrics: SessionMetrics,
}

#[derive(Debug, Deserialize)]
struct CredentialRevokePayload {
    token_id: String,
    #[serde(default)]
    reason: String,
}

/// Builds the closure the queue consumer's worker pool calls per message.
/// Unrecognised event types are logged and acknowledged rather than
/// dead-lettered — an unknown type is an integration mismatch, not a
/// transient failure a retry would ever resolve.
pub fn event_handler(resolver: Arc<ContextResolver>, credentials: Arc<CredentialBroker>) -> EventHandler {
    Arc::new(move |msg: QueueMessage| {
        let resolver = resolver.clone();
        let credentials = credentials.clone();
        Box::pin(async move { dispatch(&resolver, &credentials, msg).await })
    })
}

async fn dispatch(
    resolver: &ContextResolver,
    credentials: &CredentialBroker,
    msg: QueueMessage,
) -> Result<(), BrokerError> {
    match msg.event_type.as_str() {
        "session.unbound" => {
            let payload: SessionUnboundPayload = serde_json::from_value(msg.payload)
                .map_err(|e| BrokerError::validation(format!("malformed session.unbound payload: {e}")))?;
            resolver
                .unbind_session(&payload.session_id, &payload.metrics, UnbindReason::SessionComplete)
                .await?;
            Ok(())
        }
        "credential.revoke" => {
            let payload: CredentialRevokePayload = serde_json::from_value(msg.payload)
                .map_err(|e| BrokerError::validation(format!("malformed credential.revoke payload: {e}")))?;
            credentials.revoke(&payload.token_id, &payload.reason).await
        }
        other => {
            tracing::info!(event_type = other, delivery_id = %msg.delivery_id, "webhook: unrecognised event type, acking without action");
            Ok(())
        }
    }
}
