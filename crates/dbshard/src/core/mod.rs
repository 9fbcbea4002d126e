//! Core abstractions shared by every sharding component.
//!
//! - [`value`]: SQL values, rows and parameterized statements
//! - [`schema`]: table, column and index catalog metadata
//! - [`traits`]: driver capabilities (connect, execute, read catalog, map rows)
//! - [`identifier`]: identifier quoting for the few statements built here
//!
//! Driver crates implement [`ShardConnector`] and [`ShardConnection`]; the
//! router, executor, migration, schema and reference modules only ever talk
//! to those traits, so core logic is tested against the in-crate mock driver.

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

#[cfg(test)]
pub(crate) mod mock;

pub use schema::{ColumnDef, IndexDef, TableSchema};
pub use traits::{RowMapper, ShardConnection, ShardConnector};
pub use value::{ReferenceRow, Row, SqlValue, Statement};
