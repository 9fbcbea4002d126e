//! Driver capability traits consumed by the sharding core.
//!
//! - [`ShardConnector`]: opens a connection to one shard endpoint
//! - [`ShardConnection`]: executes statements, scripts and catalog reads
//! - [`RowMapper`]: converts raw rows into typed values
//!
//! The core never constructs dialect-specific connections or SQL itself;
//! a driver crate implements these traits and is injected at construction.

use async_trait::async_trait;

use crate::error::Result;
use crate::topology::ShardDescriptor;

use super::schema::TableSchema;
use super::value::{ReferenceRow, Row, Statement};

/// Open connections to shards.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one connector is shared by every
/// concurrent unit of a fan-out.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    /// Open a ready-to-use connection to `shard`.
    ///
    /// Errors are reported by the core as the shard being unavailable.
    async fn open(&self, shard: &ShardDescriptor) -> Result<Box<dyn ShardConnection>>;

    /// Get the database type identifier (e.g., "postgres", "mssql").
    fn db_type(&self) -> &str;
}

/// An open session against a single shard.
///
/// Each concurrent unit owns its connection exclusively and drops it when
/// the unit completes or is cancelled.
#[async_trait]
pub trait ShardConnection: Send {
    /// Run a parameterized query and return all rows.
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Run a parameterized command and return the affected row count.
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Run a multi-statement DDL script.
    ///
    /// Drivers whose engine supports transactional DDL should run the script
    /// in a single transaction.
    async fn execute_script(&mut self, script: &str) -> Result<()>;

    /// Read table, column and index definitions from the live catalog.
    async fn read_catalog(&mut self) -> Result<Vec<TableSchema>>;

    /// Insert-or-update rows by natural key.
    async fn upsert_rows(
        &mut self,
        table: &str,
        key_columns: &[String],
        rows: &[ReferenceRow],
    ) -> Result<u64>;
}

/// Convert raw result rows into typed values.
pub trait RowMapper<T>: Send + Sync {
    fn map_row(&self, row: &Row) -> Result<T>;
}

impl<T, F> RowMapper<T> for F
where
    F: Fn(&Row) -> Result<T> + Send + Sync,
{
    fn map_row(&self, row: &Row) -> Result<T> {
        self(row)
    }
}
