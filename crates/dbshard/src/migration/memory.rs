//! Process-local ledger.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::history::{sort_history, MigrationHistoryStore};
use super::{validate_transition, MigrationRecord};
use crate::error::{Result, ShardError};
use crate::topology::ShardId;

/// Ledger held in memory. Lost when the process exits.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Mutex<BTreeMap<(ShardId, String), MigrationRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(ShardId, String), MigrationRecord>>> {
        self.records
            .lock()
            .map_err(|_| ShardError::History("in-memory ledger lock poisoned".into()))
    }
}

#[async_trait]
impl MigrationHistoryStore for InMemoryHistoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, shard: &ShardId, migration_id: &str) -> Result<Option<MigrationRecord>> {
        Ok(self
            .lock()?
            .get(&(shard.clone(), migration_id.to_string()))
            .cloned())
    }

    async fn record(&self, record: &MigrationRecord) -> Result<()> {
        let mut records = self.lock()?;
        let key = (record.shard_id.clone(), record.migration_id.clone());
        validate_transition(records.get(&key), record)?;
        records.insert(key, record.clone());
        Ok(())
    }

    async fn history(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>> {
        let mut records: Vec<MigrationRecord> = self
            .lock()?
            .values()
            .filter(|r| &r.shard_id == shard)
            .cloned()
            .collect();
        sort_history(&mut records);
        Ok(records)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationStatus;

    #[tokio::test]
    async fn test_applied_is_write_once() {
        let store = InMemoryHistoryStore::new();
        let s1 = ShardId::from("s1");
        store
            .record(&MigrationRecord::new(s1.clone(), "001", MigrationStatus::Applied))
            .await
            .unwrap();
        let err = store
            .record(&MigrationRecord::new(s1.clone(), "001", MigrationStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::MigrationConflict { .. }));
        assert_eq!(
            store.get(&s1, "001").await.unwrap().unwrap().status,
            MigrationStatus::Applied
        );
    }

    #[tokio::test]
    async fn test_history_filters_by_shard() {
        let store = InMemoryHistoryStore::new();
        for (shard, id) in [("s1", "001"), ("s2", "001"), ("s1", "002")] {
            store
                .record(&MigrationRecord::new(shard.into(), id, MigrationStatus::Applied))
                .await
                .unwrap();
        }
        let history = store.history(&"s1".into()).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|r| r.migration_id.as_str()).collect();
        assert_eq!(ids, vec!["001", "002"]);
        assert_eq!(store.backend_type(), "memory");
    }
}
