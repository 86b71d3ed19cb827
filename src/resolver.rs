//! Context Resolution & Anchoring Engine (§4.D) — the hard subsystem.
//! Fingerprints anchors, looks up or mints context entities, binds/unbinds
//! sessions, appends to the per-context ledger, and accumulates DNA/trust.

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{BrokerError, ErrorKind};
use crate::identifiers;
use crate::minting::MintingClient;
use crate::models::{
    AnchorHints, Anchors, ContextDna, ContextEntity, ContextLedgerEntry, ContextSessionBinding,
    ContextStatus, DecommissionAction, DecommissionPreview, LedgerEventType, LifecycleKind,
    PendingContext, ResolutionResult, RollupResult, SessionMetrics, TrustEvolutionEntry,
    UnbindReason, GENESIS_HASH,
};

/// Trust formula defaults (§4.D, documented as inferred — §9).
const TRUST_ALPHA: f64 = 20.0;
const TRUST_BETA: f64 = 10.0;
const TRUST_GAMMA: f64 = 2.0;
const INITIAL_TRUST_SCORE: i32 = 50;

pub struct ContextResolver {
    pool: PgPool,
    minting: MintingClient,
}

/// Canonicalisation (§4.D, resolved open question): anchors are joined in
/// the fixed field order `projectPath, workspace, supportType, organization`,
/// trimmed and lower-cased, missing fields as empty segments, joined with a
/// `|` separator before hashing. Order is fixed by the struct's field order
/// at compile time, independent of caller-supplied JSON key order.
pub fn anchor_hash(anchors: &Anchors) -> String {
    let norm = |s: &Option<String>| -> String {
        s.as_deref().unwrap_or("").trim().to_lowercase()
    };
    let joined = format!(
        "{}|{}|{}|{}",
        norm(&anchors.project_path),
        norm(&anchors.workspace),
        anchors.support_type.trim().to_lowercase(),
        norm(&anchors.organization),
    );
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

fn ledger_entry_hash(context_id: Uuid, sequence: i64, previous_hash: &str, event_type: LedgerEventType, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context_id.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(previous_hash.as_bytes());
    hasher.update(format!("{event_type:?}").as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl ContextResolver {
    pub fn new(pool: PgPool, minting: MintingClient) -> Self {
        Self { pool, minting }
    }

    /// `resolve(hints) -> ResolutionResult` (§4.D).
    pub async fn resolve(&self, hints: &AnchorHints) -> Result<ResolutionResult, BrokerError> {
        if let Some(explicit) = hints.explicit_chitty_id.as_deref() {
            return match self.find_by_chitty_id(explicit).await? {
                Some(context) => Ok(ResolutionResult::BindExisting {
                    context,
                    confidence: 1.0,
                    reason: "explicit chittyId match".to_string(),
                }),
                None => Ok(ResolutionResult::Error {
                    reason: format!("no context found for explicit chittyId '{explicit}'"),
                }),
            };
        }

        if hints.project_path.is_none() && hints.workspace.is_none() {
            return Ok(ResolutionResult::Error {
                reason: "insufficient hints: projectPath, workspace, and explicitChittyId are all absent".to_string(),
            });
        }

        let anchors = Anchors::from(hints);
        let hash = anchor_hash(&anchors);

        if let Some(context) = self.find_by_hash(&hash).await? {
            return Ok(ResolutionResult::BindExisting {
                context,
                confidence: 1.0,
                reason: "exact anchor hash match".to_string(),
            });
        }

        let fuzzy = self.find_fuzzy(&anchors).await?;
        if let Some(context) = fuzzy {
            let confidence = (0.6 + 0.3 * (context.trust_score as f64 / 100.0)).clamp(0.6, 0.9);
            return Ok(ResolutionResult::BindExistingFuzzy {
                context,
                confidence,
                reason: "matched on (projectPath, supportType) without an exact anchor hash".to_string(),
            });
        }

        Ok(ResolutionResult::CreateNew {
            pending_context: PendingContext { anchors, context_hash: hash },
            reason: "no matching context found".to_string(),
        })
    }

    async fn find_by_chitty_id(&self, chitty_id: &str) -> Result<Option<ContextEntity>, BrokerError> {
        sqlx::query_as::<_, ContextEntity>("SELECT * FROM contexts WHERE chitty_id = $1")
            .bind(chitty_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<ContextEntity>, BrokerError> {
        sqlx::query_as::<_, ContextEntity>(
            "SELECT * FROM contexts WHERE context_hash = $1 AND status IN ('active', 'dormant') LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
    }

    /// Highest `trustScore`, tie-broken by most recent `lastActivity` (§4.D
    /// ordering and tie-breaks).
    async fn find_fuzzy(&self, anchors: &Anchors) -> Result<Option<ContextEntity>, BrokerError> {
        sqlx::query_as::<_, ContextEntity>(
            "SELECT * FROM contexts WHERE status = 'active' AND project_path IS NOT DISTINCT FROM $1 \
             AND support_type = $2 ORDER BY trust_score DESC, last_activity DESC LIMIT 1",
        )
        .bind(&anchors.project_path)
        .bind(&anchors.support_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
    }

    /// `createContext(pendingContext) -> ContextEntity` (§4.D).
    pub async fn create_context(&self, pending: &PendingContext) -> Result<ContextEntity, BrokerError> {
        let (chitty_id, unsigned) = match self.minting.mint_context_id(None).await {
            Ok(id) => (id, false),
            Err(e) => {
                tracing::warn!(error = %e, "resolver: minting service unavailable, generating fallback id");
                (identifiers::generate_fallback(identifiers::ENTITY_TYPE_PERSON), true)
            }
        };

        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO contexts \
             (id, chitty_id, context_hash, signature, project_path, workspace, support_type, organization, \
              trust_score, trust_level, status, total_sessions, last_activity, unsigned, lifecycle, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'active', 0, $11, $12, NULL, $11)",
        )
        .bind(id)
        .bind(&chitty_id)
        .bind(&pending.context_hash)
        .bind(format!("sig-{chitty_id}"))
        .bind(&pending.anchors.project_path)
        .bind(&pending.anchors.workspace)
        .bind(&pending.anchors.support_type)
        .bind(&pending.anchors.organization)
        .bind(INITIAL_TRUST_SCORE)
        .bind(INITIAL_TRUST_SCORE / 20)
        .bind(now)
        .bind(unsigned)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            tx.rollback().await.ok();
            let storage_err = crate::storage::error::StorageError::from(e);
            if matches!(storage_err, crate::storage::error::StorageError::Conflict(_)) {
                return Err(BrokerError::conflict(
                    "context_hash already claimed by a concurrently-created active context; re-run resolve",
                ));
            }
            return Err(BrokerError::from(storage_err));
        }

        sqlx::query(
            "INSERT INTO context_dna (context_id, patterns, traits, competencies, expertise_domains, \
             interactions_count, decisions_count, success_rate, peak_hours, updated_at) \
             VALUES ($1, '[]', '[]', '[]', '[]', 0, 0, 0.0, '[]', $2)",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let genesis_payload = json!({ "type": "genesis" });
        let genesis_hash = ledger_entry_hash(id, 0, GENESIS_HASH, LedgerEventType::Transaction, &genesis_payload);
        sqlx::query(
            "INSERT INTO context_ledger (id, context_id, sequence, hash, previous_hash, event_type, payload, created_at) \
             VALUES ($1, $2, 0, $3, $4, 'transaction', $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(&genesis_hash)
        .bind(GENESIS_HASH)
        .bind(&genesis_payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        self.find_by_chitty_id(&chitty_id)
            .await?
            .ok_or_else(|| BrokerError::new(ErrorKind::Server, "context vanished immediately after insert"))
    }

    /// `bindSession(context, sessionId, platform) -> Binding` (§4.D).
    pub async fn bind_session(
        &self,
        context_id: Uuid,
        session_id: &str,
        platform: Option<&str>,
    ) -> Result<ContextSessionBinding, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        let binding = bind_session_tx(&mut tx, context_id, session_id, platform).await?;
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        Ok(binding)
    }

    /// `unbindSession(sessionId, sessionMetrics) -> RollupResult` (§4.D).
    pub async fn unbind_session(
        &self,
        session_id: &str,
        metrics: &SessionMetrics,
        reason: UnbindReason,
    ) -> Result<RollupResult, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        let rollup = unbind_session_tx(&mut tx, session_id, metrics, reason).await?;
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        Ok(rollup)
    }

    /// `switchContext(sessionId, fromChittyId, toChittyId, metrics)` (§4.D).
    /// Atomic: unbind current + bind target inside one transaction.
    pub async fn switch_context(
        &self,
        session_id: &str,
        to_chitty_id: &str,
        metrics: &SessionMetrics,
    ) -> Result<ContextSessionBinding, BrokerError> {
        let target = self
            .find_by_chitty_id(to_chitty_id)
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("target context '{to_chitty_id}' not found")))?;

        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let current_binding: Option<(Uuid,)> = sqlx::query_as(
            "SELECT context_id FROM context_session_bindings WHERE session_id = $1 AND unbound_at IS NULL",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        if let Some((current_context_id,)) = current_binding {
            if current_context_id == target.id {
                tx.commit().await.ok();
                return sqlx::query_as::<_, ContextSessionBinding>(
                    "SELECT * FROM context_session_bindings WHERE session_id = $1 AND unbound_at IS NULL",
                )
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)));
            }
            unbind_session_tx(&mut tx, session_id, metrics, UnbindReason::SessionComplete).await?;
        }

        let binding = bind_session_tx(&mut tx, target.id, session_id, None).await?;
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        Ok(binding)
    }

    /// `preview(contextId)` (§4.D decommissioning).
    pub async fn preview_decommission(&self, context_id: Uuid) -> Result<DecommissionPreview, BrokerError> {
        let active_sessions: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM context_session_bindings WHERE context_id = $1 AND unbound_at IS NULL",
        )
        .bind(context_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let ledger_entries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM context_ledger WHERE context_id = $1")
            .bind(context_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let trust_logs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trust_evolution_entries WHERE context_id = $1")
            .bind(context_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let mut warnings = Vec::new();
        if active_sessions.0 > 0 {
            warnings.push(format!("{} active session(s) bound to this context", active_sessions.0));
        }

        let recommendation = if active_sessions.0 > 0 {
            "archive with force=true, or wait for sessions to unbind".to_string()
        } else {
            "safe to archive or revoke".to_string()
        };

        Ok(DecommissionPreview {
            context_id,
            active_sessions: active_sessions.0,
            ledger_entries: ledger_entries.0,
            trust_logs: trust_logs.0,
            warnings,
            recommendation,
        })
    }

    /// `decommission(contextId, action, force?)` (§4.D).
    pub async fn decommission(
        &self,
        context_id: Uuid,
        action: DecommissionAction,
        force: bool,
    ) -> Result<ContextEntity, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let active_bindings: Vec<(String,)> = sqlx::query_as(
            "SELECT session_id FROM context_session_bindings WHERE context_id = $1 AND unbound_at IS NULL",
        )
        .bind(context_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        if !active_bindings.is_empty() && !force {
            tx.rollback().await.ok();
            return Err(BrokerError::conflict(format!(
                "{} active session(s) bound; pass force=true to decommission anyway",
                active_bindings.len()
            )));
        }

        for (session_id,) in &active_bindings {
            let empty_metrics = SessionMetrics {
                interactions: 0,
                decisions: 0,
                success_rate: 0.0,
                anomaly_delta: 0.0,
                consistency_bonus: 0.0,
                competencies: vec![],
                expertise_domains: vec![],
                peak_hour: None,
            };
            unbind_session_tx(&mut tx, session_id, &empty_metrics, UnbindReason::Revoked).await?;
        }

        let new_status = match action {
            DecommissionAction::Archive => ContextStatus::Archived,
            DecommissionAction::Revoke => ContextStatus::Revoked,
        };
        let status_str = match new_status {
            ContextStatus::Archived => "archived",
            ContextStatus::Revoked => "revoked",
            _ => unreachable!(),
        };

        sqlx::query("UPDATE contexts SET status = $1 WHERE id = $2")
            .bind(status_str)
            .bind(context_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        append_ledger_entry_tx(
            &mut tx,
            context_id,
            LedgerEventType::Decision,
            json!({ "type": "decommission", "action": status_str, "force": force }),
        )
        .await?;

        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        self.find_by_id(context_id)
            .await?
            .ok_or_else(|| BrokerError::new(ErrorKind::Server, "context vanished after decommission"))
    }

    pub async fn find_by_id(&self, context_id: Uuid) -> Result<Option<ContextEntity>, BrokerError> {
        sqlx::query_as::<_, ContextEntity>("SELECT * FROM contexts WHERE id = $1")
            .bind(context_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
    }

    pub async fn search(&self, support_type: Option<&str>, status: Option<&str>, limit: i64) -> Result<Vec<ContextEntity>, BrokerError> {
        sqlx::query_as::<_, ContextEntity>(
            "SELECT * FROM contexts WHERE ($1::text IS NULL OR support_type = $1) \
             AND ($2::text IS NULL OR status = $2) ORDER BY last_activity DESC LIMIT $3",
        )
        .bind(support_type)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
    }

    /// Lifecycle operations (§4.D) — all mint a new Person-type id tagged
    /// with a `lifecycle` kind; never a new entity code.
    ///
    /// `supernova`: merge `source_ids` into one new context. Sources are
    /// archived; the new context's trust score is the mean of its sources'.
    pub async fn supernova(&self, source_ids: &[Uuid]) -> Result<ContextEntity, BrokerError> {
        self.merge_lifecycle(source_ids, LifecycleKind::Supernova).await
    }

    /// `fission`: split `source_id` into `count` new sibling contexts, each
    /// inheriting an equal share of the source's trust score. The source is
    /// archived.
    pub async fn fission(&self, source_id: Uuid, count: u32) -> Result<Vec<ContextEntity>, BrokerError> {
        let source = self
            .find_by_id(source_id)
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("source context '{source_id}' not found")))?;

        let share = (source.trust_score / count.max(1) as i32).max(0);
        let mut children = Vec::new();
        for _ in 0..count {
            children.push(self.spawn_lifecycle_context(LifecycleKind::Fission, &[source_id], share).await?);
        }

        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        sqlx::query("UPDATE contexts SET status = 'archived' WHERE id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        append_ledger_entry_tx(
            &mut tx,
            source_id,
            LedgerEventType::Decision,
            json!({ "type": "fission", "children": children.iter().map(|c| &c.chitty_id).collect::<Vec<_>>() }),
        )
        .await?;
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        Ok(children)
    }

    /// `derivative`: spawn a new context derived from `source_id` without
    /// archiving it — source keeps operating, the derivative starts at a
    /// reduced trust score.
    pub async fn derivative(&self, source_id: Uuid) -> Result<ContextEntity, BrokerError> {
        let source = self
            .find_by_id(source_id)
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("source context '{source_id}' not found")))?;
        let inherited = (source.trust_score * 7 / 10).max(0);
        self.spawn_lifecycle_context(LifecycleKind::Derivative, &[source_id], inherited).await
    }

    /// `suspension`: sets `source_id` dormant and spawns a companion holder
    /// context (still Person-type) recording the suspension in its metadata,
    /// so downstream consumers that expect a resolvable id during the
    /// suspension window have one.
    pub async fn suspension(&self, source_id: Uuid, reason: &str) -> Result<ContextEntity, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        sqlx::query("UPDATE contexts SET status = 'dormant' WHERE id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        append_ledger_entry_tx(
            &mut tx,
            source_id,
            LedgerEventType::Anomaly,
            json!({ "type": "suspension", "reason": reason }),
        )
        .await?;
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        self.spawn_lifecycle_context(LifecycleKind::Suspension, &[source_id], 0).await
    }

    async fn merge_lifecycle(&self, source_ids: &[Uuid], kind: LifecycleKind) -> Result<ContextEntity, BrokerError> {
        if source_ids.is_empty() {
            return Err(BrokerError::validation("supernova requires at least one source context"));
        }
        let mut total_trust = 0i64;
        for id in source_ids {
            let source = self
                .find_by_id(*id)
                .await?
                .ok_or_else(|| BrokerError::not_found(format!("source context '{id}' not found")))?;
            total_trust += source.trust_score as i64;
        }
        let mean_trust = (total_trust / source_ids.len() as i64) as i32;

        let merged = self.spawn_lifecycle_context(kind, source_ids, mean_trust).await?;

        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        for id in source_ids {
            sqlx::query("UPDATE contexts SET status = 'archived' WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
            append_ledger_entry_tx(
                &mut tx,
                *id,
                LedgerEventType::Decision,
                json!({ "type": "supernova", "merged_into": merged.chitty_id }),
            )
            .await?;
        }
        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        Ok(merged)
    }

    async fn spawn_lifecycle_context(
        &self,
        kind: LifecycleKind,
        source_ids: &[Uuid],
        trust_score: i32,
    ) -> Result<ContextEntity, BrokerError> {
        let chitty_id = match self.minting.mint_context_id(Some(kind.as_str())).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, lifecycle = kind.as_str(), "resolver: minting unavailable for lifecycle op, using fallback id");
                identifiers::generate_fallback(identifiers::ENTITY_TYPE_PERSON)
            }
        };

        let mut tx = self.pool.begin().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let synthetic_hash = format!("lifecycle:{}:{}", kind.as_str(), id);

        sqlx::query(
            "INSERT INTO contexts \
             (id, chitty_id, context_hash, signature, project_path, workspace, support_type, organization, \
              trust_score, trust_level, status, total_sessions, last_activity, unsigned, lifecycle, created_at) \
             VALUES ($1, $2, $3, $4, NULL, NULL, 'lifecycle', NULL, $5, $6, 'active', 0, $7, false, $8, $7)",
        )
        .bind(id)
        .bind(&chitty_id)
        .bind(&synthetic_hash)
        .bind(format!("sig-{chitty_id}"))
        .bind(trust_score)
        .bind(trust_score / 20)
        .bind(now)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        sqlx::query(
            "INSERT INTO context_dna (context_id, patterns, traits, competencies, expertise_domains, \
             interactions_count, decisions_count, success_rate, peak_hours, updated_at) \
             VALUES ($1, '[]', '[]', '[]', '[]', 0, 0, 0.0, '[]', $2)",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let genesis_payload = json!({ "type": "genesis", "lifecycle": kind.as_str(), "sources": source_ids });
        let genesis_hash = ledger_entry_hash(id, 0, GENESIS_HASH, LedgerEventType::Transaction, &genesis_payload);
        sqlx::query(
            "INSERT INTO context_ledger (id, context_id, sequence, hash, previous_hash, event_type, payload, created_at) \
             VALUES ($1, $2, 0, $3, $4, 'transaction', $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(&genesis_hash)
        .bind(GENESIS_HASH)
        .bind(&genesis_payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        tx.commit().await.map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| BrokerError::new(ErrorKind::Server, "lifecycle context vanished after insert"))
    }
}

async fn bind_session_tx(
    tx: &mut Transaction<'_, Postgres>,
    context_id: Uuid,
    session_id: &str,
    platform: Option<&str>,
) -> Result<ContextSessionBinding, BrokerError> {
    let existing: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM context_session_bindings WHERE session_id = $1 AND unbound_at IS NULL",
    )
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
    if existing.is_some() {
        return Err(BrokerError::conflict(format!("session '{session_id}' already has an active binding")));
    }

    let context: ContextEntity = sqlx::query_as("SELECT * FROM contexts WHERE id = $1 FOR UPDATE")
        .bind(context_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
        .ok_or_else(|| BrokerError::not_found(format!("context '{context_id}' not found")))?;

    if !matches!(context.status, ContextStatus::Active | ContextStatus::Dormant) {
        return Err(BrokerError::conflict(format!(
            "context '{context_id}' has status {:?}, cannot bind", context.status
        )));
    }

    let now = Utc::now();
    sqlx::query("UPDATE contexts SET status = 'active', total_sessions = total_sessions + 1, last_activity = $1 WHERE id = $2")
        .bind(now)
        .bind(context_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    let binding_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO context_session_bindings \
         (id, session_id, context_id, platform, bound_at, last_activity, unbound_at, unbind_reason, \
          interactions_count, decisions_count, session_success_rate) \
         VALUES ($1, $2, $3, $4, $5, $5, NULL, NULL, 0, 0, 0.0)",
    )
    .bind(binding_id)
    .bind(session_id)
    .bind(context_id)
    .bind(platform)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    append_ledger_entry_tx(
        tx,
        context_id,
        LedgerEventType::Decision,
        json!({ "type": "session_bound", "session_id": session_id, "platform": platform }),
    )
    .await?;

    sqlx::query_as::<_, ContextSessionBinding>("SELECT * FROM context_session_bindings WHERE id = $1")
        .bind(binding_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))
}

async fn unbind_session_tx(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    metrics: &SessionMetrics,
    reason: UnbindReason,
) -> Result<RollupResult, BrokerError> {
    let binding: ContextSessionBinding = sqlx::query_as(
        "SELECT * FROM context_session_bindings WHERE session_id = $1 AND unbound_at IS NULL FOR UPDATE",
    )
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("no active binding for session '{session_id}'")))?;

    let unbind_reason_str = match reason {
        UnbindReason::SessionComplete => "session_complete",
        UnbindReason::Timeout => "timeout",
        UnbindReason::Error => "error",
        UnbindReason::Revoked => "revoked",
    };

    let now = Utc::now();
    sqlx::query(
        "UPDATE context_session_bindings SET unbound_at = $1, unbind_reason = $2, \
         interactions_count = $3, decisions_count = $4, session_success_rate = $5 WHERE id = $6",
    )
    .bind(now)
    .bind(unbind_reason_str)
    .bind(metrics.interactions)
    .bind(metrics.decisions)
    .bind(metrics.success_rate)
    .bind(binding.id)
    .execute(&mut **tx)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    // Lock the owning context for the remainder of this rollup so ledger
    // append-ordering and trust mutation are serialized per-context (§5).
    let context: ContextEntity = sqlx::query_as("SELECT * FROM contexts WHERE id = $1 FOR UPDATE")
        .bind(binding.context_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    let mut dna: ContextDna = sqlx::query_as("SELECT * FROM context_dna WHERE context_id = $1 FOR UPDATE")
        .bind(binding.context_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    let old_success_rate = dna.success_rate;
    let old_interactions = dna.interactions_count;
    let total_interactions = old_interactions + metrics.interactions;
    let new_success_rate = if total_interactions > 0 {
        (old_success_rate * old_interactions as f64 + metrics.success_rate * metrics.interactions as f64)
            / total_interactions as f64
    } else {
        old_success_rate
    };

    let mut competencies: Vec<String> = serde_json::from_value(dna.competencies.clone()).unwrap_or_default();
    for c in &metrics.competencies {
        if !competencies.contains(c) {
            competencies.push(c.clone());
        }
    }
    let mut domains: Vec<String> = serde_json::from_value(dna.expertise_domains.clone()).unwrap_or_default();
    for d in &metrics.expertise_domains {
        if !domains.contains(d) {
            domains.push(d.clone());
        }
    }
    let mut peak_hours: Vec<u8> = serde_json::from_value(dna.peak_hours.clone()).unwrap_or_default();
    if let Some(hour) = metrics.peak_hour.or_else(|| Some(now.hour() as u8)) {
        if !peak_hours.contains(&hour) {
            peak_hours.push(hour);
        }
    }

    dna.interactions_count = total_interactions;
    dna.decisions_count += metrics.decisions;
    dna.success_rate = new_success_rate.clamp(0.0, 1.0);
    dna.competencies = serde_json::to_value(&competencies).unwrap_or(json!([]));
    dna.expertise_domains = serde_json::to_value(&domains).unwrap_or(json!([]));
    dna.peak_hours = serde_json::to_value(&peak_hours).unwrap_or(json!([]));
    dna.updated_at = now;

    sqlx::query(
        "UPDATE context_dna SET patterns = $1, traits = $2, competencies = $3, expertise_domains = $4, \
         interactions_count = $5, decisions_count = $6, success_rate = $7, peak_hours = $8, updated_at = $9 \
         WHERE context_id = $10",
    )
    .bind(&dna.patterns)
    .bind(&dna.traits)
    .bind(&dna.competencies)
    .bind(&dna.expertise_domains)
    .bind(dna.interactions_count)
    .bind(dna.decisions_count)
    .bind(dna.success_rate)
    .bind(&dna.peak_hours)
    .bind(now)
    .bind(binding.context_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    let delta_success_rate = metrics.success_rate - old_success_rate;
    let raw_score = context.trust_score as f64
        + TRUST_ALPHA * delta_success_rate
        - TRUST_BETA * metrics.anomaly_delta
        + TRUST_GAMMA * metrics.consistency_bonus;
    let new_score = raw_score.clamp(0.0, 100.0).round() as i32;
    let new_level = (new_score / 20).clamp(0, 5);
    let trust_changed = new_score != context.trust_score || new_level != context.trust_level;

    sqlx::query("UPDATE contexts SET trust_score = $1, trust_level = $2, last_activity = $3 WHERE id = $4")
        .bind(new_score)
        .bind(new_level)
        .bind(now)
        .bind(context.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    if trust_changed {
        let factors = json!({
            "delta_success_rate": delta_success_rate,
            "anomaly_delta": metrics.anomaly_delta,
            "consistency_bonus": metrics.consistency_bonus,
        });
        let mut hasher = Sha256::new();
        hasher.update(context.id.as_bytes());
        hasher.update(context.trust_level.to_le_bytes());
        hasher.update(new_level.to_le_bytes());
        hasher.update(b"session_unbind_rollup");
        hasher.update(factors.to_string().as_bytes());
        let content_hash = hex::encode(hasher.finalize());

        sqlx::query(
            "INSERT INTO trust_evolution_entries \
             (id, context_id, previous_level, previous_score, new_level, new_score, change_trigger, content_hash, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4())
        .bind(context.id)
        .bind(context.trust_level)
        .bind(context.trust_score)
        .bind(new_level)
        .bind(new_score)
        .bind("session_unbind_rollup")
        .bind(&content_hash)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;
    }

    let ledger_entry = append_ledger_entry_tx(
        tx,
        context.id,
        LedgerEventType::Outcome,
        json!({
            "type": "session_unbound",
            "session_id": session_id,
            "reason": unbind_reason_str,
            "interactions": metrics.interactions,
            "success_rate": metrics.success_rate,
        }),
    )
    .await?;

    let dna = sqlx::query_as::<_, ContextDna>("SELECT * FROM context_dna WHERE context_id = $1")
        .bind(context.id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok(RollupResult {
        context_id: context.id,
        dna,
        new_trust_score: new_score,
        new_trust_level: new_level,
        trust_changed,
        ledger_entry,
    })
}

/// Append a ledger entry chained from the current head (§4.D, §5). The
/// context row must already be locked (`FOR UPDATE`) by the caller's
/// transaction so the read-of-head-then-insert is serialized per context;
/// a unique-violation retry loop guards the remaining race window regardless.
async fn append_ledger_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
    context_id: Uuid,
    event_type: LedgerEventType,
    payload: serde_json::Value,
) -> Result<ContextLedgerEntry, BrokerError> {
    const MAX_RETRIES: u32 = 3;
    let mut last_err = None;

    for _ in 0..MAX_RETRIES {
        let head: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence, hash FROM context_ledger WHERE context_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(context_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

        let (prev_sequence, previous_hash) = match head {
            Some((seq, hash)) => (seq, hash),
            None => (-1, GENESIS_HASH.to_string()),
        };
        let sequence = prev_sequence + 1;
        let hash = ledger_entry_hash(context_id, sequence, &previous_hash, event_type, &payload);
        let event_type_str = match event_type {
            LedgerEventType::Transaction => "transaction",
            LedgerEventType::Decision => "decision",
            LedgerEventType::Outcome => "outcome",
            LedgerEventType::Anomaly => "anomaly",
        };
        let entry_id = Uuid::new_v4();
        let now: DateTime<Utc> = Utc::now();

        let result = sqlx::query(
            "INSERT INTO context_ledger (id, context_id, sequence, hash, previous_hash, event_type, payload, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry_id)
        .bind(context_id)
        .bind(sequence)
        .bind(&hash)
        .bind(&previous_hash)
        .bind(event_type_str)
        .bind(&payload)
        .bind(now)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => {
                return Ok(ContextLedgerEntry {
                    id: entry_id,
                    context_id,
                    sequence,
                    hash,
                    previous_hash,
                    event_type,
                    payload,
                    created_at: now,
                });
            }
            Err(e) => {
                let storage_err = crate::storage::error::StorageError::from(e);
                if matches!(storage_err, crate::storage::error::StorageError::Conflict(_)) {
                    last_err = Some(storage_err);
                    continue;
                }
                return Err(BrokerError::from(storage_err));
            }
        }
    }

    Err(BrokerError::new(
        ErrorKind::Server,
        format!(
            "ledger append for context '{context_id}' failed after {MAX_RETRIES} retries: {:?}",
            last_err
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Anchors;

    #[test]
    fn anchor_hash_is_stable_regardless_of_whitespace_and_case() {
        let a = Anchors {
            project_path: Some("/Users/bob/Proj".to_string()),
            workspace: Some(" Dev ".to_string()),
            support_type: "Development".to_string(),
            organization: None,
        };
        let b = Anchors {
            project_path: Some("/users/bob/proj".to_string()),
            workspace: Some("dev".to_string()),
            support_type: "development".to_string(),
            organization: None,
        };
        assert_eq!(anchor_hash(&a), anchor_hash(&b));
    }

    #[test]
    fn anchor_hash_differs_on_distinct_anchors() {
        let a = Anchors {
            project_path: Some("/p1".to_string()),
            workspace: Some("dev".to_string()),
            support_type: "development".to_string(),
            organization: None,
        };
        let b = Anchors { project_path: Some("/p2".to_string()), ..a.clone() };
        assert_ne!(anchor_hash(&a), anchor_hash(&b));
    }

    #[test]
    fn ledger_entry_hash_is_deterministic() {
        let id = Uuid::new_v4();
        let payload = json!({"x": 1});
        let h1 = ledger_entry_hash(id, 0, GENESIS_HASH, LedgerEventType::Transaction, &payload);
        let h2 = ledger_entry_hash(id, 0, GENESIS_HASH, LedgerEventType::Transaction, &payload);
        assert_eq!(h1, h2);
    }
}
