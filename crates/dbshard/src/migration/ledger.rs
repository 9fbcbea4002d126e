//! Ledger kept in a table on each shard.
//!
//! The ledger row lives next to the schema it describes, so a shard restored
//! from backup carries its own migration history. Statements go through the
//! driver's connection capability like any other query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::history::{sort_history, status_to_str, str_to_status, MigrationHistoryStore};
use super::{validate_transition, MigrationRecord};
use crate::connection::ShardedConnectionFactory;
use crate::core::identifier::{quote_literal, quote_mssql, quote_pg, quote_qualified};
use crate::core::{Row, ShardConnection, SqlValue, Statement};
use crate::error::{Result, ShardError};
use crate::topology::ShardId;

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "_dbshard_migrations";

/// Dialect-specific statement text for the ledger table.
///
/// Parameters are positional:
/// - `select_one`: shard_id, migration_id
/// - `select_shard`: shard_id
/// - `upsert`: shard_id, migration_id, status, applied_at_utc, error_detail
///
/// Selects must return the columns `shard_id, migration_id, status,
/// applied_at_utc, error_detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStatements {
    pub create_table: String,
    pub select_one: String,
    pub select_shard: String,
    pub upsert: String,
}

impl LedgerStatements {
    /// PostgreSQL statements for `table` (optionally schema-qualified).
    pub fn postgres(table: &str) -> Result<Self> {
        let t = quote_qualified(table, quote_pg)?;
        Ok(Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    shard_id TEXT NOT NULL,
                    migration_id TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'failed', 'rolled_back')),
                    applied_at_utc TIMESTAMPTZ NOT NULL,
                    error_detail TEXT,
                    PRIMARY KEY (shard_id, migration_id)
                )"
            ),
            select_one: format!(
                "SELECT shard_id, migration_id, status, applied_at_utc, error_detail
                 FROM {t} WHERE shard_id = $1 AND migration_id = $2"
            ),
            select_shard: format!(
                "SELECT shard_id, migration_id, status, applied_at_utc, error_detail
                 FROM {t} WHERE shard_id = $1 ORDER BY applied_at_utc, migration_id"
            ),
            upsert: format!(
                "INSERT INTO {t} (shard_id, migration_id, status, applied_at_utc, error_detail)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (shard_id, migration_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    applied_at_utc = EXCLUDED.applied_at_utc,
                    error_detail = EXCLUDED.error_detail"
            ),
        })
    }

    /// SQL Server statements for `table` (optionally schema-qualified).
    pub fn mssql(table: &str) -> Result<Self> {
        let t = quote_qualified(table, quote_mssql)?;
        let object_name = quote_literal(&t);
        Ok(Self {
            create_table: format!(
                "IF OBJECT_ID(N{object_name}, N'U') IS NULL
                 CREATE TABLE {t} (
                    shard_id NVARCHAR(128) NOT NULL,
                    migration_id NVARCHAR(256) NOT NULL,
                    status NVARCHAR(16) NOT NULL,
                    applied_at_utc DATETIME2 NOT NULL,
                    error_detail NVARCHAR(MAX) NULL,
                    PRIMARY KEY (shard_id, migration_id)
                 )"
            ),
            select_one: format!(
                "SELECT shard_id, migration_id, status, applied_at_utc, error_detail
                 FROM {t} WHERE shard_id = @P1 AND migration_id = @P2"
            ),
            select_shard: format!(
                "SELECT shard_id, migration_id, status, applied_at_utc, error_detail
                 FROM {t} WHERE shard_id = @P1 ORDER BY applied_at_utc, migration_id"
            ),
            upsert: format!(
                "MERGE {t} WITH (HOLDLOCK) AS target
                 USING (SELECT @P1 AS shard_id, @P2 AS migration_id, @P3 AS status,
                               @P4 AS applied_at_utc, @P5 AS error_detail) AS source
                 ON target.shard_id = source.shard_id AND target.migration_id = source.migration_id
                 WHEN MATCHED THEN UPDATE SET
                    status = source.status,
                    applied_at_utc = source.applied_at_utc,
                    error_detail = source.error_detail
                 WHEN NOT MATCHED THEN INSERT (shard_id, migration_id, status, applied_at_utc, error_detail)
                    VALUES (source.shard_id, source.migration_id, source.status,
                            source.applied_at_utc, source.error_detail);"
            ),
        })
    }

    /// Statements for a driver type name (`postgres`, `mssql`).
    pub fn for_db_type(db_type: &str, table: &str) -> Result<Self> {
        match db_type.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Self::postgres(table),
            "mssql" | "sqlserver" | "sql_server" => Self::mssql(table),
            other => Err(ShardError::Config(format!(
                "no ledger statements for database type '{}'",
                other
            ))),
        }
    }
}

/// Ledger stored on the shards themselves.
pub struct ShardLedgerStore {
    factory: ShardedConnectionFactory,
    statements: LedgerStatements,
}

impl ShardLedgerStore {
    pub fn new(factory: ShardedConnectionFactory, statements: LedgerStatements) -> Self {
        Self {
            factory,
            statements,
        }
    }

    /// Create the ledger table on one shard.
    pub async fn init_shard(&self, shard: &ShardId) -> Result<()> {
        let mut conn = self.factory.open(shard).await?;
        conn.execute_script(&self.statements.create_table).await?;
        debug!("Ledger table ready on shard {}", shard);
        Ok(())
    }

    async fn fetch_one(
        &self,
        conn: &mut Box<dyn ShardConnection>,
        shard: &ShardId,
        migration_id: &str,
    ) -> Result<Option<MigrationRecord>> {
        let statement = Statement::new(self.statements.select_one.as_str())
            .bind(shard.as_str())
            .bind(migration_id);
        conn.query(&statement)
            .await?
            .first()
            .map(decode_record)
            .transpose()
    }
}

#[async_trait]
impl MigrationHistoryStore for ShardLedgerStore {
    async fn init(&self) -> Result<()> {
        for shard in self.factory.topology().ids() {
            self.init_shard(shard).await?;
        }
        Ok(())
    }

    async fn get(&self, shard: &ShardId, migration_id: &str) -> Result<Option<MigrationRecord>> {
        let mut conn = self.factory.open(shard).await?;
        self.fetch_one(&mut conn, shard, migration_id).await
    }

    async fn record(&self, record: &MigrationRecord) -> Result<()> {
        let mut conn = self.factory.open(&record.shard_id).await?;
        let current = self
            .fetch_one(&mut conn, &record.shard_id, &record.migration_id)
            .await?;
        validate_transition(current.as_ref(), record)?;

        let statement = Statement::new(self.statements.upsert.as_str())
            .bind(record.shard_id.as_str())
            .bind(record.migration_id.as_str())
            .bind(status_to_str(record.status))
            .bind(record.applied_at_utc)
            .bind(record.error_detail.clone());
        conn.execute(&statement).await?;
        Ok(())
    }

    async fn history(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>> {
        let mut conn = self.factory.open(shard).await?;
        let statement = Statement::new(self.statements.select_shard.as_str()).bind(shard.as_str());
        let mut records = conn
            .query(&statement)
            .await?
            .iter()
            .map(decode_record)
            .collect::<Result<Vec<_>>>()?;
        sort_history(&mut records);
        Ok(records)
    }

    fn backend_type(&self) -> &'static str {
        "shard"
    }
}

fn decode_record(row: &Row) -> Result<MigrationRecord> {
    let text = |column: &str| -> Result<String> {
        row.get(column)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ShardError::History(format!("ledger row has no text column '{}'", column))
            })
    };

    let applied_at_utc = match row.get("applied_at_utc") {
        Some(SqlValue::Timestamp(ts)) => *ts,
        Some(SqlValue::Text(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| ShardError::History(format!("invalid applied_at_utc '{}': {}", s, e)))?,
        _ => {
            return Err(ShardError::History(
                "ledger row has no applied_at_utc timestamp".into(),
            ))
        }
    };

    Ok(MigrationRecord {
        shard_id: ShardId::new(text("shard_id")?),
        migration_id: text("migration_id")?,
        status: str_to_status(&text("status")?)?,
        applied_at_utc,
        error_detail: row.get("error_detail").and_then(|v| v.as_str()).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::MockConnector;
    use crate::migration::{ApplyOutcome, MigrationExecutor, MigrationStatus};
    use crate::topology::{ShardDescriptor, ShardTopology};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Emulates the ledger table on one mock shard: upserts store the bound
    /// parameters, selects return them.
    fn ledger_table(mock: &MockConnector, shard: &str) {
        let rows: Arc<Mutex<HashMap<(String, String), Vec<SqlValue>>>> = Arc::default();
        mock.set_handler(
            shard,
            Arc::new(move |statement: &Statement| -> Result<Vec<Row>> {
                let mut rows = rows.lock().unwrap();
                let p = &statement.params;
                let key = |i: usize| {
                    p.get(i)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                let to_row = |values: &Vec<SqlValue>| {
                    Row::from_pairs(
                        ["shard_id", "migration_id", "status", "applied_at_utc", "error_detail"]
                            .into_iter()
                            .zip(values.iter().cloned()),
                    )
                };

                if statement.sql.trim_start().starts_with("INSERT") {
                    rows.insert((key(0), key(1)), p.clone());
                    Ok(vec![])
                } else if p.len() == 2 {
                    Ok(rows.get(&(key(0), key(1))).map(to_row).into_iter().collect())
                } else {
                    Ok(rows
                        .iter()
                        .filter(|((s, _), _)| *s == key(0))
                        .map(|(_, v)| to_row(v))
                        .collect())
                }
            }),
        );
    }

    fn factory(mock: &MockConnector) -> ShardedConnectionFactory {
        let topology = ShardTopology::new(
            1,
            vec![
                ShardDescriptor::new("s1", "host=db1"),
                ShardDescriptor::new("s2", "host=db2"),
            ],
        )
        .unwrap();
        ShardedConnectionFactory::new(Arc::new(topology), Arc::new(mock.clone()))
    }

    #[test]
    fn test_postgres_statements_quote_table() {
        let statements = LedgerStatements::postgres("ops.ledger").unwrap();
        assert!(statements.create_table.contains("\"ops\".\"ledger\""));
        assert!(statements.upsert.contains("ON CONFLICT (shard_id, migration_id)"));
        assert!(statements.select_one.contains("$2"));
    }

    #[test]
    fn test_mssql_statements_quote_table() {
        let statements = LedgerStatements::mssql(DEFAULT_LEDGER_TABLE).unwrap();
        assert!(statements.create_table.contains("[_dbshard_migrations]"));
        assert!(statements.create_table.contains("OBJECT_ID(N'[_dbshard_migrations]'"));
        assert!(statements.upsert.starts_with("MERGE"));
        assert!(statements.select_one.contains("@P2"));
    }

    #[test]
    fn test_statements_for_db_type() {
        assert!(LedgerStatements::for_db_type("PostgreSQL", "t").is_ok());
        assert!(LedgerStatements::for_db_type("mssql", "t").is_ok());
        assert!(LedgerStatements::for_db_type("oracle", "t").is_err());
        assert!(LedgerStatements::postgres("").is_err());
    }

    #[tokio::test]
    async fn test_init_creates_table_on_every_shard() {
        let mock = MockConnector::new();
        let statements = LedgerStatements::postgres(DEFAULT_LEDGER_TABLE).unwrap();
        let store = ShardLedgerStore::new(factory(&mock), statements.clone());
        store.init().await.unwrap();
        assert_eq!(mock.scripts("s1"), vec![statements.create_table.clone()]);
        assert_eq!(mock.scripts("s2"), vec![statements.create_table]);
    }

    #[tokio::test]
    async fn test_executor_with_shard_ledger_is_idempotent() {
        let mock = MockConnector::new();
        ledger_table(&mock, "s1");
        let factory = factory(&mock);
        let store = Arc::new(ShardLedgerStore::new(
            factory.clone(),
            LedgerStatements::postgres(DEFAULT_LEDGER_TABLE).unwrap(),
        ));
        let executor = MigrationExecutor::new(factory, store.clone());
        let s1 = ShardId::from("s1");

        let first = executor.apply(&s1, "001", "CREATE TABLE t (id INT)").await.unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { newly_applied: true, .. }));
        let second = executor.apply(&s1, "001", "CREATE TABLE t (id INT)").await.unwrap();
        assert!(matches!(second, ApplyOutcome::Applied { newly_applied: false, .. }));

        assert_eq!(mock.scripts("s1").len(), 1);
        let history = store.history(&s1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MigrationStatus::Applied);
        assert_eq!(store.backend_type(), "shard");
    }

    #[test]
    fn test_decode_rejects_bad_status() {
        let row = Row::from_pairs([
            ("shard_id", SqlValue::from("s1")),
            ("migration_id", SqlValue::from("001")),
            ("status", SqlValue::from("done")),
            ("applied_at_utc", SqlValue::from("2024-01-01T00:00:00Z")),
            ("error_detail", SqlValue::Null),
        ]);
        assert!(matches!(decode_record(&row), Err(ShardError::History(_))));
    }

    #[test]
    fn test_decode_accepts_text_timestamp() {
        let row = Row::from_pairs([
            ("shard_id", SqlValue::from("s1")),
            ("migration_id", SqlValue::from("001")),
            ("status", SqlValue::from("applied")),
            ("applied_at_utc", SqlValue::from("2024-01-01T00:00:00Z")),
            ("error_detail", SqlValue::Null),
        ]);
        let record = decode_record(&row).unwrap();
        assert_eq!(record.status, MigrationStatus::Applied);
        assert!(record.error_detail.is_none());
    }
}
