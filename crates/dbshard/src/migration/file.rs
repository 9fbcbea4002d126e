//! Signed JSON-file ledger for coordinators without a shared database.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;

use super::history::{sort_history, MigrationHistoryStore};
use super::{validate_transition, MigrationRecord};
use crate::error::{Result, ShardError};
use crate::topology::ShardId;

type HmacSha256 = Hmac<Sha256>;

const LEDGER_FORMAT_VERSION: u32 = 1;

/// On-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    records: Vec<MigrationRecord>,

    /// HMAC-SHA256 over the file serialized without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl LedgerFile {
    fn compute_hmac(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| {
                ShardError::History(format!("Failed to serialize ledger for HMAC: {}", e))
            })?;

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| ShardError::History(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn load(path: &Path, key: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                version: LEDGER_FORMAT_VERSION,
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(path)?;
        let ledger: Self = serde_json::from_str(&content)?;

        let Some(stored) = &ledger.hmac else {
            return Err(ShardError::History(format!(
                "Ledger file {} has no HMAC signature and cannot be trusted",
                path.display()
            )));
        };
        if stored != &ledger.compute_hmac(key)? {
            return Err(ShardError::History(format!(
                "Ledger file {} failed integrity check: HMAC mismatch (possible tampering or wrong key)",
                path.display()
            )));
        }

        Ok(ledger)
    }

    /// Atomic write: temp file, then rename.
    fn save(&mut self, path: &Path, key: &str) -> Result<()> {
        self.version = LEDGER_FORMAT_VERSION;
        self.hmac = Some(self.compute_hmac(key)?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Ledger kept in one JSON file, signed with a caller-supplied key.
///
/// Every mutation rewrites the whole file; the ledger is small (one record
/// per shard and migration).
pub struct JsonFileHistoryStore {
    path: PathBuf,
    key: String,
    lock: Mutex<()>,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record, verifying the signature.
    pub fn load_records(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = LedgerFile::load(&self.path, &self.key)?.records;
        sort_history(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl MigrationHistoryStore for JsonFileHistoryStore {
    async fn init(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if !self.path.exists() {
            debug!("Creating ledger file {}", self.path.display());
            LedgerFile::default().save(&self.path, &self.key)?;
        }
        Ok(())
    }

    async fn get(&self, shard: &ShardId, migration_id: &str) -> Result<Option<MigrationRecord>> {
        let _guard = self.lock.lock().await;
        let ledger = LedgerFile::load(&self.path, &self.key)?;
        Ok(ledger
            .records
            .into_iter()
            .find(|r| &r.shard_id == shard && r.migration_id == migration_id))
    }

    async fn record(&self, record: &MigrationRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut ledger = LedgerFile::load(&self.path, &self.key)?;

        let existing = ledger
            .records
            .iter()
            .position(|r| r.shard_id == record.shard_id && r.migration_id == record.migration_id);
        validate_transition(existing.map(|i| &ledger.records[i]), record)?;

        match existing {
            Some(i) => ledger.records[i] = record.clone(),
            None => ledger.records.push(record.clone()),
        }
        ledger.save(&self.path, &self.key)
    }

    async fn history(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>> {
        let _guard = self.lock.lock().await;
        let mut records: Vec<MigrationRecord> = LedgerFile::load(&self.path, &self.key)?
            .records
            .into_iter()
            .filter(|r| &r.shard_id == shard)
            .collect();
        sort_history(&mut records);
        Ok(records)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let store = JsonFileHistoryStore::new(&path, "secret");
        store.init().await.unwrap();
        store
            .record(&MigrationRecord::new("s1".into(), "001", MigrationStatus::Applied))
            .await
            .unwrap();

        let reopened = JsonFileHistoryStore::new(&path, "secret");
        let record = reopened.get(&"s1".into(), "001").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Applied);
        assert_eq!(reopened.load_records().unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_tampered_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = JsonFileHistoryStore::new(&path, "secret");
        store
            .record(&MigrationRecord::new("s1".into(), "001", MigrationStatus::Failed))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"failed\"", "\"applied\"")).unwrap();

        let err = store.get(&"s1".into(), "001").await.unwrap_err();
        assert!(matches!(err, ShardError::History(_)));
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        JsonFileHistoryStore::new(&path, "secret").init().await.unwrap();

        let other = JsonFileHistoryStore::new(&path, "other");
        assert!(other.load_records().is_err());
    }

    #[tokio::test]
    async fn test_stripped_signature_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = JsonFileHistoryStore::new(&path, "secret");
        store
            .record(&MigrationRecord::new("s1".into(), "001", MigrationStatus::Failed))
            .await
            .unwrap();

        // Drop the signature and promote the record to applied.
        let mut doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc.as_object_mut().unwrap().remove("hmac");
        doc["records"][0]["status"] = serde_json::json!("applied");
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let err = store.get(&"s1".into(), "001").await.unwrap_err();
        assert!(matches!(err, ShardError::History(_)));
        assert!(err.to_string().contains("no HMAC signature"));
        assert!(store.load_records().is_err());
    }

    #[tokio::test]
    async fn test_conflict_leaves_file_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = JsonFileHistoryStore::new(&path, "secret");
        store
            .record(&MigrationRecord::new("s1".into(), "001", MigrationStatus::Applied))
            .await
            .unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let err = store
            .record(&MigrationRecord::new("s1".into(), "001", MigrationStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::MigrationConflict { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }
}
