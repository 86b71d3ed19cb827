//! Data model (§3). Row types (`sqlx::FromRow`) are kept separate from the
//! API-facing `Serialize`/`Deserialize` shapes where the two diverge, mirroring
//! the row-vs-API-struct split the rest of the corpus uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    Dormant,
    Archived,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct ContextEntity {
    pub id: Uuid,
    pub chitty_id: String,
    pub context_hash: String,
    pub signature: String,
    /// Raw anchors the context was fingerprinted from. Stored alongside
    /// `context_hash` (rather than only the hash) so fuzzy resolution
    /// (§4.D) can query on `(project_path, support_type)` directly instead
    /// of re-deriving candidates from the hash.
    pub project_path: Option<String>,
    pub workspace: Option<String>,
    pub support_type: String,
    pub organization: Option<String>,
    pub trust_score: i32,
    pub trust_level: i32,
    pub status: ContextStatus,
    pub total_sessions: i64,
    pub last_activity: DateTime<Utc>,
    pub unsigned: bool,
    pub lifecycle: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct ContextDna {
    pub context_id: Uuid,
    pub patterns: serde_json::Value,
    pub traits: serde_json::Value,
    pub competencies: serde_json::Value,
    pub expertise_domains: serde_json::Value,
    pub interactions_count: i64,
    pub decisions_count: i64,
    pub success_rate: f64,
    pub peak_hours: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerEventType {
    Transaction,
    Decision,
    Outcome,
    Anomaly,
}

pub const GENESIS_HASH: &str = "genesis";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct ContextLedgerEntry {
    pub id: Uuid,
    pub context_id: Uuid,
    pub sequence: i64,
    pub hash: String,
    pub previous_hash: String,
    pub event_type: LedgerEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnbindReason {
    SessionComplete,
    Timeout,
    Error,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct ContextSessionBinding {
    pub id: Uuid,
    pub session_id: String,
    pub context_id: Uuid,
    pub platform: Option<String>,
    pub bound_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub unbound_at: Option<DateTime<Utc>>,
    pub unbind_reason: Option<UnbindReason>,
    pub interactions_count: i64,
    pub decisions_count: i64,
    pub session_success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct TrustEvolutionEntry {
    pub id: Uuid,
    pub context_id: Uuid,
    pub previous_level: i32,
    pub previous_score: i32,
    pub new_level: i32,
    pub new_score: i32,
    pub change_trigger: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct CredentialAuditEntry {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub service: String,
    pub requesting_service: Option<String>,
    pub token_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// In-memory session state for the MCP transport (§3, §4.E). Never
/// persisted; lost on process restart by design.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct McpSession {
    pub session_id: String,
    #[serde(skip)]
    pub created_at: std::time::Instant,
    #[serde(skip)]
    pub last_access: std::time::Instant,
    pub protocol_version: String,
    pub client_info: Option<serde_json::Value>,
}

/// Session metrics threaded through `unbindSession` (§4.D).
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SessionMetrics {
    pub interactions: i64,
    #[serde(default)]
    pub decisions: i64,
    pub success_rate: f64,
    #[serde(default)]
    pub anomaly_delta: f64,
    #[serde(default)]
    pub consistency_bonus: f64,
    #[serde(default)]
    pub competencies: Vec<String>,
    #[serde(default)]
    pub expertise_domains: Vec<String>,
    #[serde(default)]
    pub peak_hour: Option<u8>,
}

/// Anchor hints accepted by `resolve` (§4.D).
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct AnchorHints {
    pub project_path: Option<String>,
    pub workspace: Option<String>,
    pub support_type: String,
    pub organization: Option<String>,
    pub explicit_chitty_id: Option<String>,
}

/// A durable session row (`/api/v1/sessions/*`, §4.F) — distinct from the
/// ephemeral in-memory `McpSession` above.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct SessionRecord {
    pub id: Uuid,
    pub session_id: String,
    pub context_id: Option<Uuid>,
    pub title: Option<String>,
    pub working_directory: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The static anchors a `PendingContext` or an existing `ContextEntity` was
/// fingerprinted from (§4.D anchor fingerprinting). Field order is fixed
/// here — it IS the canonicalisation order `contextHash` is computed over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Anchors {
    pub project_path: Option<String>,
    pub workspace: Option<String>,
    pub support_type: String,
    pub organization: Option<String>,
}

impl From<&AnchorHints> for Anchors {
    fn from(h: &AnchorHints) -> Self {
        Self {
            project_path: h.project_path.clone(),
            workspace: h.workspace.clone(),
            support_type: h.support_type.clone(),
            organization: h.organization.clone(),
        }
    }
}

/// A not-yet-persisted context awaiting confirmation (`resolve` → `CreateNew`,
/// §4.D). Carried in the API response and threaded back into `bind`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PendingContext {
    pub anchors: Anchors,
    pub context_hash: String,
}

/// The outcome of `ContextResolver::resolve` (§4.D). Tagged so the wire
/// representation carries an explicit `action` discriminant the client
/// switches on (`bind_existing` | `bind_existing_fuzzy` | `create_new` |
/// `error`).
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionResult {
    BindExisting {
        context: ContextEntity,
        confidence: f64,
        reason: String,
    },
    BindExistingFuzzy {
        context: ContextEntity,
        confidence: f64,
        reason: String,
    },
    CreateNew {
        pending_context: PendingContext,
        reason: String,
    },
    Error {
        reason: String,
    },
}

/// The outcome of `unbindSession`'s transactional rollup (§4.D).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RollupResult {
    pub context_id: Uuid,
    pub dna: ContextDna,
    pub new_trust_score: i32,
    pub new_trust_level: i32,
    pub trust_changed: bool,
    pub ledger_entry: ContextLedgerEntry,
}

/// Lifecycle operation kinds (§4.D) — context entities stay Person-type;
/// this tag lives in `ContextEntity::lifecycle`, never a new entity code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Supernova,
    Fission,
    Derivative,
    Suspension,
}

impl LifecycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleKind::Supernova => "supernova",
            LifecycleKind::Fission => "fission",
            LifecycleKind::Derivative => "derivative",
            LifecycleKind::Suspension => "suspension",
        }
    }
}

/// Result of `decommission::preview` (§4.D).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DecommissionPreview {
    pub context_id: Uuid,
    pub active_sessions: i64,
    pub ledger_entries: i64,
    pub trust_logs: i64,
    pub warnings: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DecommissionAction {
    Archive,
    Revoke,
}

/// Document metadata row — the object store (§4.A) holds bytes at
/// `/chittyid/{id}/{type}/{docId}`; this row is the queryable side.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub context_id: Uuid,
    pub doc_type: String,
    pub mime: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// A queue message that exhausted its bounded retry count (§4.G) and was
/// routed to the dead-letter surface — a relational table queryable by
/// operators, since there is no external dead-letter queue to delegate to.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub delivery_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// A KV-resident API key record (`key:{apiKey}`, §6). Looked up by
/// [`crate::auth::require_api_key`] on every protected request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiKeyRecord {
    pub status: ApiKeyStatus,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}
