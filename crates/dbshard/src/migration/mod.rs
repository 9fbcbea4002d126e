//! Per-shard schema migrations with a durable, idempotent ledger.
//!
//! [`MigrationExecutor`] applies one script to one shard at a time and
//! records the outcome in a [`MigrationHistoryStore`]. Applying a migration
//! that the ledger already shows as `Applied` is a no-op. Ordering across
//! shards, and whether to stop after a failed shard, is the caller's call.

mod file;
mod history;
mod ledger;
mod memory;

pub use file::JsonFileHistoryStore;
pub use history::{status_to_str, str_to_status, MigrationHistoryStore};
pub use ledger::{LedgerStatements, ShardLedgerStore, DEFAULT_LEDGER_TABLE};
pub use memory::InMemoryHistoryStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::ShardedConnectionFactory;
use crate::error::{Result, ShardError};
use crate::topology::ShardId;

/// Ledger status of one migration on one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Script is running (or the process died while it was).
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(status_to_str(*self))
    }
}

/// One ledger row, keyed by `(shard_id, migration_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub shard_id: ShardId,
    pub migration_id: String,
    pub status: MigrationStatus,

    /// When the record last changed status.
    pub applied_at_utc: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl MigrationRecord {
    pub fn new(
        shard_id: ShardId,
        migration_id: impl Into<String>,
        status: MigrationStatus,
    ) -> Self {
        Self {
            shard_id,
            migration_id: migration_id.into(),
            status,
            applied_at_utc: Utc::now(),
            error_detail: None,
        }
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn is_applied(&self) -> bool {
        self.status == MigrationStatus::Applied
    }
}

/// Check that `next` may replace `current` in the ledger.
///
/// - An `Applied` record is write-once. The only change allowed while it
///   stays `Applied` is annotating it (same timestamp), e.g. with the
///   detail of a failed rollback.
/// - `RolledBack` requires the current record to be `Applied`.
/// - `Pending`, `Failed` and `RolledBack` records may be re-applied.
pub fn validate_transition(
    current: Option<&MigrationRecord>,
    next: &MigrationRecord,
) -> Result<()> {
    let current_status = current.map(|c| c.status);
    match (current_status, next.status) {
        (Some(MigrationStatus::Applied), MigrationStatus::RolledBack) => Ok(()),
        (Some(MigrationStatus::Applied), MigrationStatus::Applied)
            if current.map(|c| c.applied_at_utc) == Some(next.applied_at_utc) =>
        {
            Ok(())
        }
        (Some(MigrationStatus::Applied), _) => Err(ShardError::conflict(
            &next.shard_id,
            &next.migration_id,
            "migration is already applied",
        )),
        (_, MigrationStatus::RolledBack) => Err(ShardError::conflict(
            &next.shard_id,
            &next.migration_id,
            match current_status {
                Some(status) => format!("cannot roll back a migration in status '{}'", status),
                None => "cannot roll back a migration that was never applied".to_string(),
            },
        )),
        _ => Ok(()),
    }
}

/// Result of [`MigrationExecutor::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The migration is applied. `newly_applied` is false when the ledger
    /// already had it and nothing ran.
    Applied {
        record: MigrationRecord,
        newly_applied: bool,
    },
    /// The script failed; the failure is recorded in the ledger.
    Failed {
        record: MigrationRecord,
        detail: String,
    },
}

impl ApplyOutcome {
    pub fn record(&self) -> &MigrationRecord {
        match self {
            ApplyOutcome::Applied { record, .. } | ApplyOutcome::Failed { record, .. } => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Result of [`MigrationExecutor::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack(MigrationRecord),
    /// The inverse script failed; the record stays `Applied`.
    Failed {
        record: MigrationRecord,
        detail: String,
    },
}

/// Applies and rolls back migration scripts on individual shards.
pub struct MigrationExecutor {
    factory: ShardedConnectionFactory,
    store: Arc<dyn MigrationHistoryStore>,
    statement_timeout: Option<Duration>,
}

impl MigrationExecutor {
    pub fn new(factory: ShardedConnectionFactory, store: Arc<dyn MigrationHistoryStore>) -> Self {
        Self {
            factory,
            store,
            statement_timeout: None,
        }
    }

    /// Fail scripts that run longer than `limit`.
    pub fn with_statement_timeout(mut self, limit: Duration) -> Self {
        self.statement_timeout = Some(limit);
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    pub fn store(&self) -> &Arc<dyn MigrationHistoryStore> {
        &self.store
    }

    /// Apply `script` to `shard` unless the ledger already has it applied.
    ///
    /// Script and connection failures are recorded and returned as
    /// [`ApplyOutcome::Failed`]; an `Err` means the ledger itself could not
    /// be read or written, or the request was invalid.
    pub async fn apply(
        &self,
        shard: &ShardId,
        migration_id: &str,
        script: &str,
    ) -> Result<ApplyOutcome> {
        self.check_request(shard, migration_id)?;

        if let Some(existing) = self.store.get(shard, migration_id).await? {
            if existing.is_applied() {
                info!(
                    "Migration {} already applied on shard {} at {}, skipping",
                    migration_id, shard, existing.applied_at_utc
                );
                return Ok(ApplyOutcome::Applied {
                    record: existing,
                    newly_applied: false,
                });
            }
        }

        let pending = MigrationRecord::new(shard.clone(), migration_id, MigrationStatus::Pending);
        self.store.record(&pending).await?;

        info!("Applying migration {} to shard {}", migration_id, shard);
        match self.run_script(shard, script).await {
            Ok(()) => {
                let record =
                    MigrationRecord::new(shard.clone(), migration_id, MigrationStatus::Applied);
                self.store.record(&record).await?;
                info!("Migration {} applied to shard {}", migration_id, shard);
                Ok(ApplyOutcome::Applied {
                    record,
                    newly_applied: true,
                })
            }
            Err(e) => {
                let detail = e.to_string();
                let record =
                    MigrationRecord::new(shard.clone(), migration_id, MigrationStatus::Failed)
                        .with_error(detail.clone());
                self.store.record(&record).await?;
                warn!("Migration {} failed on shard {}: {}", migration_id, shard, detail);
                Ok(ApplyOutcome::Failed { record, detail })
            }
        }
    }

    /// Run `inverse_script` and mark the migration `RolledBack`.
    ///
    /// Returns `MigrationConflict` when the ledger does not show the
    /// migration as applied.
    pub async fn rollback(
        &self,
        shard: &ShardId,
        migration_id: &str,
        inverse_script: &str,
    ) -> Result<RollbackOutcome> {
        self.check_request(shard, migration_id)?;

        let existing = match self.store.get(shard, migration_id).await? {
            Some(record) if record.is_applied() => record,
            Some(record) => {
                return Err(ShardError::conflict(
                    shard,
                    migration_id,
                    format!("cannot roll back a migration in status '{}'", record.status),
                ))
            }
            None => {
                return Err(ShardError::conflict(
                    shard,
                    migration_id,
                    "cannot roll back a migration that was never applied",
                ))
            }
        };

        info!("Rolling back migration {} on shard {}", migration_id, shard);
        match self.run_script(shard, inverse_script).await {
            Ok(()) => {
                let record =
                    MigrationRecord::new(shard.clone(), migration_id, MigrationStatus::RolledBack);
                self.store.record(&record).await?;
                info!("Migration {} rolled back on shard {}", migration_id, shard);
                Ok(RollbackOutcome::RolledBack(record))
            }
            Err(e) => {
                let detail = e.to_string();
                let record = existing.with_error(format!("rollback failed: {}", detail));
                self.store.record(&record).await?;
                warn!(
                    "Rollback of migration {} failed on shard {}: {}",
                    migration_id, shard, detail
                );
                Ok(RollbackOutcome::Failed { record, detail })
            }
        }
    }

    /// Ledger records for `shard`.
    pub async fn history(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>> {
        self.store.history(shard).await
    }

    /// Ids from `candidates` not yet applied on `shard`, in the given order.
    pub async fn pending(&self, shard: &ShardId, candidates: &[&str]) -> Result<Vec<String>> {
        let applied: std::collections::HashSet<String> = self
            .store
            .history(shard)
            .await?
            .into_iter()
            .filter(|r| r.is_applied())
            .map(|r| r.migration_id)
            .collect();

        Ok(candidates
            .iter()
            .filter(|id| !applied.contains(**id))
            .map(|id| id.to_string())
            .collect())
    }

    fn check_request(&self, shard: &ShardId, migration_id: &str) -> Result<()> {
        if !self.factory.topology().contains(shard) {
            return Err(ShardError::UnknownShard(shard.to_string()));
        }
        if migration_id.trim().is_empty() {
            return Err(ShardError::Config("migration id cannot be empty".into()));
        }
        Ok(())
    }

    async fn run_script(&self, shard: &ShardId, script: &str) -> Result<()> {
        let work = async {
            let mut conn = self.factory.open(shard).await?;
            conn.execute_script(script).await
        };
        match self.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                ShardError::query(
                    shard,
                    format!("script timed out after {}ms", limit.as_millis()),
                )
            })?,
            None => work.await,
        }
    }
}
