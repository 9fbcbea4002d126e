//! Configuration type definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::router::DEFAULT_VIRTUAL_NODES;
use crate::scatter::{FailurePolicy, ScatterGatherOptions};
use crate::topology::ShardDescriptor;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shard set and routing parameters.
    pub topology: TopologyConfig,

    /// Scatter-gather defaults.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Migration ledger settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Reference table replication limits.
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Shard topology.
///
/// `ShardDescriptor`'s `Debug` output masks credentials embedded in
/// endpoints, so the whole config is safe to log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Topology version (default: 1). Bump on every reconfiguration.
    #[serde(default = "default_version")]
    pub version: u64,

    /// Ring points per bucketed shard (default: 64).
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    /// Shards in routing order.
    pub shards: Vec<ShardDescriptor>,
}

/// Scatter-gather defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Shards worked on concurrently (default: 8).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-shard time budget in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub per_shard_timeout_ms: u64,

    /// `fail_fast` or `best_effort` (default).
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Successful shards required under best_effort (default: 1).
    #[serde(default = "default_min_successful")]
    pub min_successful_shards: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            per_shard_timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            min_successful_shards: default_min_successful(),
        }
    }
}

impl ExecutorConfig {
    pub fn to_options(&self) -> ScatterGatherOptions {
        ScatterGatherOptions {
            max_concurrency: self.max_concurrency,
            per_shard_timeout: Duration::from_millis(self.per_shard_timeout_ms),
            failure_policy: self.failure_policy,
            min_successful_shards: self.min_successful_shards,
        }
    }
}

/// Migration ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Ledger table on each shard (default: "_dbshard_migrations").
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,

    /// Fail migration scripts that run longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            ledger_table: default_ledger_table(),
            statement_timeout_ms: None,
        }
    }
}

impl MigrationsConfig {
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }
}

/// Reference table replication limits. Replication is always best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_timeout_ms")]
    pub per_shard_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            per_shard_timeout_ms: default_timeout_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn per_shard_timeout(&self) -> Duration {
        Duration::from_millis(self.per_shard_timeout_ms)
    }
}

// Default value functions for serde
fn default_version() -> u64 {
    1
}

fn default_virtual_nodes() -> u32 {
    DEFAULT_VIRTUAL_NODES
}

fn default_max_concurrency() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_min_successful() -> usize {
    1
}

fn default_ledger_table() -> String {
    crate::migration::DEFAULT_LEDGER_TABLE.to_string()
}
