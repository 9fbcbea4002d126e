//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::connection::ShardedConnectionFactory;
use crate::error::Result;
use crate::migration::{
    LedgerStatements, MigrationExecutor, MigrationHistoryStore, ShardLedgerStore,
};
use crate::reference::ReferenceTableStore;
use crate::router::ShardRouter;
use crate::scatter::ShardedQueryExecutor;
use crate::topology::ShardTopology;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Build the shard topology described by this config.
    pub fn build_topology(&self) -> Result<ShardTopology> {
        ShardTopology::new(self.topology.version, self.topology.shards.clone())
    }

    /// Build a router over `topology` with the configured ring density.
    pub fn build_router(&self, topology: Arc<ShardTopology>) -> Result<ShardRouter> {
        ShardRouter::with_virtual_nodes(topology, self.topology.virtual_nodes)
    }

    /// Query executor using the `executor` section as its defaults.
    pub fn build_query_executor(&self, factory: ShardedConnectionFactory) -> ShardedQueryExecutor {
        ShardedQueryExecutor::new(factory, self.executor.to_options())
    }

    /// Ledger statements for `db_type` against `migrations.ledger_table`.
    pub fn build_ledger_statements(&self, db_type: &str) -> Result<LedgerStatements> {
        LedgerStatements::for_db_type(db_type, &self.migrations.ledger_table)
    }

    /// Per-shard ledger in the configured table, in the factory's dialect.
    pub fn build_ledger_store(
        &self,
        factory: ShardedConnectionFactory,
    ) -> Result<ShardLedgerStore> {
        let statements = self.build_ledger_statements(factory.db_type())?;
        Ok(ShardLedgerStore::new(factory, statements))
    }

    /// Migration executor honoring `migrations.statement_timeout_ms`.
    pub fn build_migration_executor(
        &self,
        factory: ShardedConnectionFactory,
        store: Arc<dyn MigrationHistoryStore>,
    ) -> MigrationExecutor {
        let executor = MigrationExecutor::new(factory, store);
        match self.migrations.statement_timeout() {
            Some(limit) => executor.with_statement_timeout(limit),
            None => executor,
        }
    }

    /// Reference table store with the `replication` limits.
    pub fn build_reference_store(&self, factory: ShardedConnectionFactory) -> ReferenceTableStore {
        ReferenceTableStore::new(factory).with_limits(
            self.replication.max_concurrency,
            self.replication.per_shard_timeout(),
        )
    }
}
