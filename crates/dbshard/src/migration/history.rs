//! Storage interface for the migration ledger.
//!
//! Implementations:
//!
//! - [`InMemoryHistoryStore`](super::InMemoryHistoryStore): process-local, for tests and dry runs
//! - [`JsonFileHistoryStore`](super::JsonFileHistoryStore): signed JSON file on the
//!   coordinator host
//! - [`ShardLedgerStore`](super::ShardLedgerStore): a ledger table on every shard
//!
//! The executor works with `Arc<dyn MigrationHistoryStore>` without knowing
//! which one it has.

use async_trait::async_trait;

use super::{MigrationRecord, MigrationStatus};
use crate::error::{Result, ShardError};
use crate::topology::ShardId;

/// Durable ledger of migration outcomes, one record per
/// `(shard_id, migration_id)`.
///
/// Records are never deleted. `record` replaces the previous record for the
/// same pair and must reject transitions that
/// [`validate_transition`](super::validate_transition) rejects.
#[async_trait]
pub trait MigrationHistoryStore: Send + Sync {
    /// Create the backing table/file. Safe to call repeatedly.
    async fn init(&self) -> Result<()>;

    /// Current record for one migration on one shard.
    async fn get(&self, shard: &ShardId, migration_id: &str) -> Result<Option<MigrationRecord>>;

    /// Insert or replace the record for `(record.shard_id, record.migration_id)`.
    async fn record(&self, record: &MigrationRecord) -> Result<()>;

    /// All records for `shard`, oldest first.
    async fn history(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Convert a status to its stored representation.
pub fn status_to_str(status: MigrationStatus) -> &'static str {
    match status {
        MigrationStatus::Pending => "pending",
        MigrationStatus::Applied => "applied",
        MigrationStatus::Failed => "failed",
        MigrationStatus::RolledBack => "rolled_back",
    }
}

/// Parse a stored status.
pub fn str_to_status(s: &str) -> Result<MigrationStatus> {
    match s {
        "pending" => Ok(MigrationStatus::Pending),
        "applied" => Ok(MigrationStatus::Applied),
        "failed" => Ok(MigrationStatus::Failed),
        "rolled_back" => Ok(MigrationStatus::RolledBack),
        _ => Err(ShardError::History(format!("Invalid migration status: {}", s))),
    }
}

/// Sort records oldest first, breaking ties by migration id.
pub(crate) fn sort_history(records: &mut [MigrationRecord]) {
    records.sort_by(|a, b| {
        a.applied_at_utc
            .cmp(&b.applied_at_utc)
            .then_with(|| a.migration_id.cmp(&b.migration_id))
    });
}
