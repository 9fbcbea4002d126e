//! # dbshard
//!
//! Shard routing, scatter-gather execution and per-shard schema coordination
//! for horizontally partitioned SQL databases.
//!
//! This library provides:
//!
//! - **Deterministic routing** of entity keys to shards (modulo or a
//!   consistent-hash ring with virtual nodes)
//! - **Scatter-gather** queries with bounded concurrency, per-shard timeouts
//!   and fail-fast or best-effort failure policies
//! - **Idempotent migrations** recorded per shard in a durable ledger
//! - **Schema drift detection** between shards
//! - **Reference table replication** to every shard
//!
//! The crate is driver-agnostic: a database driver implements
//! [`ShardConnector`] and [`ShardConnection`] and everything else works
//! through those traits.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbshard::{Config, ShardedConnectionFactory, ShardTargets, Statement};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load("shards.yaml")?;
//! let topology = Arc::new(config.build_topology()?);
//! let factory = ShardedConnectionFactory::new(topology, Arc::new(my_driver));
//! let executor = config.build_query_executor(factory);
//!
//! let outcome = executor
//!     .execute(
//!         Statement::new("SELECT count(*) AS n FROM orders"),
//!         ShardTargets::All,
//!         executor.defaults(),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! for (shard, failure) in outcome.failures() {
//!     eprintln!("{} degraded: {}", shard, failure);
//! }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod migration;
pub mod reference;
pub mod router;
pub mod scatter;
pub mod schema;
pub mod topology;

// Re-exports for convenient access
pub use config::{Config, ExecutorConfig, MigrationsConfig, ReplicationConfig, TopologyConfig};
pub use connection::ShardedConnectionFactory;
pub use core::{Row, RowMapper, ShardConnection, ShardConnector, SqlValue, Statement, TableSchema};
pub use error::{FailureKind, Result, ShardError, ShardFailure};
pub use migration::{
    ApplyOutcome, InMemoryHistoryStore, JsonFileHistoryStore, LedgerStatements, MigrationExecutor,
    MigrationHistoryStore, MigrationRecord, MigrationStatus, RollbackOutcome, ShardLedgerStore,
};
pub use reference::{ReferenceRow, ReferenceTable, ReferenceTableStore, ReplicationReport};
pub use router::{ShardKey, ShardRouter};
pub use scatter::{
    FailurePolicy, GatherFailure, ScatterGatherOptions, ScatterGatherOutcome, ShardResult,
    ShardTargets, ShardedQueryExecutor,
};
pub use schema::{diff, DriftKind, DriftReport, SchemaDrift, SchemaIntrospector, SchemaSnapshot};
pub use topology::{ShardDescriptor, ShardId, ShardTopology};
