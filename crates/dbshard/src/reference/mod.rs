//! Reference tables replicated identically to every shard.
//!
//! Reference data (countries, currencies, feature flags...) is small and
//! changes rarely. Writes fan out to every shard with best-effort semantics:
//! a shard that fails is reported back and left for the caller to retry,
//! and shards that succeeded keep their writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ShardedConnectionFactory;
use crate::core::identifier::validate_identifier;
use crate::core::SqlValue;
use crate::error::{Result, ShardError, ShardFailure};
use crate::scatter::{
    FailurePolicy, GatherFailure, ScatterGatherOptions, ShardResult, ShardTargets,
    ShardedQueryExecutor,
};
use crate::topology::ShardId;

pub use crate::core::ReferenceRow;

/// Declaration of a reference table and its natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTable {
    pub name: String,
    pub key_columns: Vec<String>,
}

impl ReferenceTable {
    pub fn new<I, S>(name: impl Into<String>, key_columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = Self {
            name: name.into(),
            key_columns: key_columns.into_iter().map(Into::into).collect(),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        if self.key_columns.is_empty() {
            return Err(ShardError::Config(format!(
                "reference table '{}' declares no key columns",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.key_columns {
            validate_identifier(column)?;
            if !seen.insert(column.as_str()) {
                return Err(ShardError::Config(format!(
                    "reference table '{}' lists key column '{}' twice",
                    self.name, column
                )));
            }
        }
        Ok(())
    }

    /// Every row must carry a non-null value for each key column, and no two
    /// rows may share a key.
    pub fn validate_rows(&self, rows: &[ReferenceRow]) -> Result<()> {
        let mut keys = HashSet::new();
        for (i, row) in rows.iter().enumerate() {
            let mut key = Vec::with_capacity(self.key_columns.len());
            for column in &self.key_columns {
                match row.get(column) {
                    Some(value) if !value.is_null() => key.push(format!("{:?}", value)),
                    _ => {
                        return Err(ShardError::Config(format!(
                            "row {} of reference table '{}' has no value for key column '{}'",
                            i, self.name, column
                        )))
                    }
                }
            }
            if !keys.insert(key.join("|")) {
                return Err(ShardError::Config(format!(
                    "row {} of reference table '{}' repeats key ({})",
                    i,
                    self.name,
                    key.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Per-shard outcome of one replication.
#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub table: String,

    /// One entry per shard in topology order; the value is the number of
    /// rows the shard reported as written.
    pub results: Vec<ShardResult<u64>>,

    /// The caller cancelled before every shard finished. Shards that had
    /// already written keep their rows.
    pub cancelled: bool,
}

impl ReplicationReport {
    pub fn succeeded_shards(&self) -> Vec<ShardId> {
        self.results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.shard_id.clone())
            .collect()
    }

    pub fn failed_shards(&self) -> Vec<(ShardId, ShardFailure)> {
        self.results
            .iter()
            .filter_map(|r| r.error.clone().map(|e| (r.shard_id.clone(), e)))
            .collect()
    }

    /// Every shard holds the new rows.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.results.iter().all(|r| r.is_success())
    }

    /// Turn an incomplete report into `ReplicationPartialFailure`, or
    /// `Cancelled` when cancellation cut the run short without a shard
    /// failing.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else if self.failed_shards().is_empty() {
            Err(ShardError::Cancelled)
        } else {
            Err(ShardError::ReplicationPartialFailure {
                failures: self.failed_shards(),
                table: self.table,
            })
        }
    }
}

/// Writes reference tables to every shard in the topology.
pub struct ReferenceTableStore {
    executor: ShardedQueryExecutor,
    options: ScatterGatherOptions,
}

impl ReferenceTableStore {
    pub fn new(factory: ShardedConnectionFactory) -> Self {
        let options = Self::replication_options(ScatterGatherOptions::default());
        Self {
            executor: ShardedQueryExecutor::new(factory, options.clone()),
            options,
        }
    }

    /// Override concurrency and per-shard timeout.
    pub fn with_limits(mut self, max_concurrency: usize, per_shard_timeout: Duration) -> Self {
        self.options = Self::replication_options(ScatterGatherOptions {
            max_concurrency,
            per_shard_timeout,
            ..self.options
        });
        self
    }

    pub fn options(&self) -> &ScatterGatherOptions {
        &self.options
    }

    /// Replication never fails as a whole because of a shard.
    fn replication_options(options: ScatterGatherOptions) -> ScatterGatherOptions {
        ScatterGatherOptions {
            failure_policy: FailurePolicy::BestEffort,
            min_successful_shards: 0,
            ..options
        }
    }

    /// Insert-or-update `rows` by natural key on every shard.
    ///
    /// Shard failures are returned in the report. On cancellation the
    /// report carries whatever shards had finished, with `cancelled` set.
    /// `Err` is reserved for an invalid table or row set.
    pub async fn replicate(
        &self,
        table: &ReferenceTable,
        rows: Vec<ReferenceRow>,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport> {
        table.validate()?;
        table.validate_rows(&rows)?;

        info!(
            "Replicating {} row(s) of {} to {} shard(s)",
            rows.len(),
            table.name,
            self.executor.factory().topology().len()
        );

        let name = Arc::new(table.name.clone());
        let keys = Arc::new(table.key_columns.clone());
        let rows = Arc::new(rows);

        let gathered = self
            .executor
            .scatter(ShardTargets::All, &self.options, cancel, move |_shard, conn| {
                let name = name.clone();
                let keys = keys.clone();
                let rows = rows.clone();
                async move {
                    let mut conn = conn;
                    conn.upsert_rows(&name, &keys, &rows).await
                }
                .boxed()
            })
            .await;

        let (results, cancelled) = match gathered {
            Ok(outcome) => (outcome.results, false),
            Err(GatherFailure {
                error: ShardError::Cancelled,
                completed,
            }) => (completed, true),
            Err(failure) => return Err(failure.error),
        };
        let report = ReplicationReport {
            table: table.name.clone(),
            results,
            cancelled,
        };

        if report.cancelled {
            warn!(
                "Replication of {} cancelled with {}/{} shard(s) written",
                report.table,
                report.succeeded_shards().len(),
                report.results.len()
            );
            return Ok(report);
        }

        let failed = report.failed_shards();
        if failed.is_empty() {
            info!("Replicated {} to every shard", report.table);
        } else {
            for (shard, failure) in &failed {
                warn!("Replication of {} to shard {} failed: {}", report.table, shard, failure);
            }
            info!(
                "Replicated {} to {}/{} shard(s)",
                report.table,
                report.results.len() - failed.len(),
                report.results.len()
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::MockConnector;
    use crate::error::FailureKind;
    use crate::topology::{ShardDescriptor, ShardTopology};

    fn store(mock: &MockConnector) -> ReferenceTableStore {
        let topology = ShardTopology::new(
            1,
            vec![
                ShardDescriptor::new("s1", "host=db1"),
                ShardDescriptor::new("s2", "host=db2"),
                ShardDescriptor::new("s3", "host=db3"),
            ],
        )
        .unwrap();
        ReferenceTableStore::new(ShardedConnectionFactory::new(
            Arc::new(topology),
            Arc::new(mock.clone()),
        ))
    }

    fn countries() -> ReferenceTable {
        ReferenceTable::new("countries", ["code"]).unwrap()
    }

    fn rows() -> Vec<ReferenceRow> {
        vec![
            ReferenceRow::new().with("code", "DE").with("name", "Germany"),
            ReferenceRow::new().with("code", "FR").with("name", "France"),
        ]
    }

    #[tokio::test]
    async fn test_replicate_to_every_shard() {
        let mock = MockConnector::new();
        let report = store(&mock)
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|r| r.value == Some(2)));
        for id in ["s1", "s2", "s3"] {
            assert_eq!(mock.table_rows(id, "countries").len(), 2);
        }
    }

    #[tokio::test]
    async fn test_unreachable_shard_keeps_other_writes() {
        let mock = MockConnector::new();
        mock.set_unreachable("s2");

        let report = store(&mock)
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded_shards(), vec![ShardId::from("s1"), ShardId::from("s3")]);
        let failed = report.failed_shards();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.as_str(), "s2");
        assert_eq!(failed[0].1.kind, FailureKind::Unavailable);

        assert_eq!(mock.table_rows("s1", "countries").len(), 2);
        assert_eq!(mock.table_rows("s3", "countries").len(), 2);
        assert!(mock.table_rows("s2", "countries").is_empty());

        match report.into_result() {
            Err(ShardError::ReplicationPartialFailure { table, failures }) => {
                assert_eq!(table, "countries");
                assert_eq!(failures.len(), 1);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.table)),
        }
    }

    #[tokio::test]
    async fn test_retry_after_shard_recovers() {
        let mock = MockConnector::new();
        let store = store(&mock);
        mock.set_unreachable("s2");
        let first = store
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.failed_shards().len(), 1);

        mock.set_reachable("s2");
        let second = store
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(second.is_complete());
        assert_eq!(mock.table_rows("s2", "countries").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reports_shards_already_written() {
        let mock = MockConnector::new();
        mock.set_delay("s3", Duration::from_secs(10));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = store(&mock)
            .replicate(&countries(), rows(), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(report.succeeded_shards(), vec![ShardId::from("s1"), ShardId::from("s2")]);
        let failed = report.failed_shards();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.as_str(), "s3");
        assert_eq!(failed[0].1.kind, FailureKind::Cancelled);
        assert!(mock.table_rows("s3", "countries").is_empty());
        assert!(matches!(
            report.into_result(),
            Err(ShardError::ReplicationPartialFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_every_shard_failing_is_still_a_report() {
        let mock = MockConnector::new();
        for id in ["s1", "s2", "s3"] {
            mock.set_query_error(id, "permission denied");
        }
        let report = store(&mock)
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded_shards().is_empty());
        assert!(report
            .failed_shards()
            .iter()
            .all(|(_, f)| f.kind == FailureKind::Query));
    }

    #[tokio::test]
    async fn test_replicate_upserts_by_key() {
        let mock = MockConnector::new();
        let store = store(&mock);
        store
            .replicate(&countries(), rows(), &CancellationToken::new())
            .await
            .unwrap();
        store
            .replicate(
                &countries(),
                vec![ReferenceRow::new().with("code", "DE").with("name", "Deutschland")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let stored = mock.table_rows("s1", "countries");
        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .any(|r| r.get("name") == Some(&SqlValue::from("Deutschland"))));
    }

    #[tokio::test]
    async fn test_rows_missing_key_are_rejected_before_writing() {
        let mock = MockConnector::new();
        let err = store(&mock)
            .replicate(
                &countries(),
                vec![ReferenceRow::new().with("name", "Atlantis")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Config(_)));
        assert_eq!(mock.opened("s1"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_replication() {
        let mock = MockConnector::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store(&mock)
            .replicate(&countries(), rows(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Cancelled));
    }

    #[test]
    fn test_table_declaration_validation() {
        assert!(ReferenceTable::new("countries", Vec::<String>::new()).is_err());
        assert!(ReferenceTable::new("", ["code"]).is_err());
        assert!(ReferenceTable::new("countries", ["code", "code"]).is_err());
        assert!(ReferenceTable::new("currencies", ["code", "valid_from"]).is_ok());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let table = countries();
        let rows = vec![
            ReferenceRow::new().with("code", "DE"),
            ReferenceRow::new().with("code", "DE"),
        ];
        assert!(table.validate_rows(&rows).is_err());
        assert!(table
            .validate_rows(&[ReferenceRow::new().with("code", SqlValue::Null)])
            .is_err());
    }
}
