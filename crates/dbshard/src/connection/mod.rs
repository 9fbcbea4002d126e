//! Opens connections to named shards through the injected driver.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::{ShardConnection, ShardConnector};
use crate::error::{Result, ShardError};
use crate::topology::{ShardDescriptor, ShardId, ShardTopology};

/// Connection factory bound to one topology.
///
/// Cheap to clone; every clone shares the topology and the connector.
#[derive(Clone)]
pub struct ShardedConnectionFactory {
    topology: Arc<ShardTopology>,
    connector: Arc<dyn ShardConnector>,
}

impl ShardedConnectionFactory {
    pub fn new(topology: Arc<ShardTopology>, connector: Arc<dyn ShardConnector>) -> Self {
        Self {
            topology,
            connector,
        }
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    /// Get the database type of the injected driver.
    pub fn db_type(&self) -> &str {
        self.connector.db_type()
    }

    /// Open a connection to the shard named `id`.
    pub async fn open(&self, id: &ShardId) -> Result<Box<dyn ShardConnection>> {
        let shard = self
            .topology
            .get(id)
            .ok_or_else(|| ShardError::UnknownShard(id.to_string()))?;
        self.open_descriptor(shard).await
    }

    /// Open a connection to `shard`. Driver errors are reported as the shard
    /// being unavailable.
    pub async fn open_descriptor(
        &self,
        shard: &ShardDescriptor,
    ) -> Result<Box<dyn ShardConnection>> {
        debug!(
            "Opening {} connection to shard {} ({})",
            self.connector.db_type(),
            shard.id,
            shard.redacted_endpoint()
        );
        self.connector.open(shard).await.map_err(|e| match e {
            ShardError::ShardUnavailable { .. } => e,
            other => {
                warn!("Shard {}: connection failed: {}", shard.id, other);
                ShardError::unavailable(&shard.id, other.to_string())
            }
        })
    }

    /// Open a connection, giving up after `limit`.
    pub async fn open_with_timeout(
        &self,
        id: &ShardId,
        limit: Duration,
    ) -> Result<Box<dyn ShardConnection>> {
        match tokio::time::timeout(limit, self.open(id)).await {
            Ok(result) => result,
            Err(_) => Err(ShardError::unavailable(
                id,
                format!("connect timed out after {}ms", limit.as_millis()),
            )),
        }
    }
}
