//! Fire-and-forget audit logging for operator-initiated actions that don't
//! belong to any single context's ledger (API key issuance/revocation,
//! manual decommission overrides). Context-scoped events go through
//! [`crate::resolver`]'s ledger instead — this is the catch-all for
//! everything else.

/// Insert an audit log entry. Errors are logged but never propagated —
/// audit must not break the action it's recording.
pub async fn log_admin_action(
    pool: &sqlx::PgPool,
    action: &str,
    details: serde_json::Value,
    actor: Option<&str>,
) {
    if let Err(e) = sqlx::query(
        "INSERT INTO admin_audit_log (id, action, details, actor, created_at) VALUES ($1, $2, $3, $4, now())",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(action)
    .bind(&details)
    .bind(actor)
    .execute(pool)
    .await
    {
        tracing::warn!(action, error = %e, "audit: failed to record admin action");
    }
}
