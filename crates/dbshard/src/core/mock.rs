//! In-memory driver used by unit tests.
//!
//! Every shard is an independent in-memory state keyed by shard id. Tests
//! inject unreachable shards, connect delays, query and script failures,
//! canned rows, catalogs and statement handlers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, ShardError};
use crate::topology::{ShardDescriptor, ShardId};

use super::schema::TableSchema;
use super::traits::{ShardConnection, ShardConnector};
use super::value::{ReferenceRow, Row, Statement};

pub(crate) type Handler = Arc<dyn Fn(&Statement) -> Result<Vec<Row>> + Send + Sync>;

#[derive(Default)]
struct MockShard {
    unreachable: bool,
    connect_delay: Duration,
    query_error: Option<String>,
    script_error: Option<String>,
    rows: Vec<Row>,
    catalog: Vec<TableSchema>,
    handler: Option<Handler>,
    scripts: Vec<String>,
    statements: Vec<Statement>,
    tables: HashMap<String, BTreeMap<String, ReferenceRow>>,
    opened: usize,
}

#[derive(Default)]
struct Inner {
    shards: Mutex<HashMap<ShardId, MockShard>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_shard<R>(&self, id: &str, f: impl FnOnce(&mut MockShard) -> R) -> R {
        let mut shards = self.inner.shards.lock().unwrap();
        f(shards.entry(ShardId::from(id)).or_default())
    }

    pub fn set_unreachable(&self, id: &str) {
        self.with_shard(id, |s| s.unreachable = true);
    }

    pub fn set_reachable(&self, id: &str) {
        self.with_shard(id, |s| s.unreachable = false);
    }

    pub fn set_delay(&self, id: &str, delay: Duration) {
        self.with_shard(id, |s| s.connect_delay = delay);
    }

    pub fn set_query_error(&self, id: &str, message: &str) {
        self.with_shard(id, |s| s.query_error = Some(message.to_string()));
    }

    pub fn set_script_error(&self, id: &str, message: &str) {
        self.with_shard(id, |s| s.script_error = Some(message.to_string()));
    }

    pub fn clear_script_error(&self, id: &str) {
        self.with_shard(id, |s| s.script_error = None);
    }

    pub fn set_rows(&self, id: &str, rows: Vec<Row>) {
        self.with_shard(id, |s| s.rows = rows);
    }

    pub fn set_catalog(&self, id: &str, catalog: Vec<TableSchema>) {
        self.with_shard(id, |s| s.catalog = catalog);
    }

    pub fn set_handler(&self, id: &str, handler: Handler) {
        self.with_shard(id, |s| s.handler = Some(handler));
    }

    pub fn scripts(&self, id: &str) -> Vec<String> {
        self.with_shard(id, |s| s.scripts.clone())
    }

    pub fn statements(&self, id: &str) -> Vec<Statement> {
        self.with_shard(id, |s| s.statements.clone())
    }

    pub fn table_rows(&self, id: &str, table: &str) -> Vec<ReferenceRow> {
        self.with_shard(id, |s| {
            s.tables
                .get(table)
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn opened(&self, id: &str) -> usize {
        self.with_shard(id, |s| s.opened)
    }

    /// Highest number of simultaneously open connections observed.
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardConnector for MockConnector {
    async fn open(&self, shard: &ShardDescriptor) -> Result<Box<dyn ShardConnection>> {
        let (unreachable, delay) = self.with_shard(shard.id.as_str(), |s| {
            s.opened += 1;
            (s.unreachable, s.connect_delay)
        });

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        let conn = MockConnection {
            id: shard.id.clone(),
            inner: self.inner.clone(),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(ShardError::unavailable(&shard.id, "connection refused"));
        }
        Ok(Box::new(conn))
    }

    fn db_type(&self) -> &str {
        "mock"
    }
}

struct MockConnection {
    id: ShardId,
    inner: Arc<Inner>,
}

impl MockConnection {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockShard) -> R) -> R {
        let mut shards = self.inner.shards.lock().unwrap();
        f(shards.entry(self.id.clone()).or_default())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShardConnection for MockConnection {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let id = self.id.clone();
        self.with_state(|s| {
            s.statements.push(statement.clone());
            if let Some(msg) = &s.query_error {
                return Err(ShardError::query(&id, msg.clone()));
            }
            match &s.handler {
                Some(handler) => handler(statement),
                None => Ok(s.rows.clone()),
            }
        })
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let id = self.id.clone();
        self.with_state(|s| {
            s.statements.push(statement.clone());
            if let Some(msg) = &s.query_error {
                return Err(ShardError::query(&id, msg.clone()));
            }
            match &s.handler {
                Some(handler) => handler(statement).map(|rows| rows.len() as u64),
                None => Ok(1),
            }
        })
    }

    async fn execute_script(&mut self, script: &str) -> Result<()> {
        let id = self.id.clone();
        self.with_state(|s| {
            if let Some(msg) = &s.script_error {
                return Err(ShardError::query(&id, msg.clone()));
            }
            s.scripts.push(script.to_string());
            Ok(())
        })
    }

    async fn read_catalog(&mut self) -> Result<Vec<TableSchema>> {
        Ok(self.with_state(|s| s.catalog.clone()))
    }

    async fn upsert_rows(
        &mut self,
        table: &str,
        key_columns: &[String],
        rows: &[ReferenceRow],
    ) -> Result<u64> {
        let id = self.id.clone();
        self.with_state(|s| {
            if let Some(msg) = &s.query_error {
                return Err(ShardError::query(&id, msg.clone()));
            }
            let stored = s.tables.entry(table.to_string()).or_default();
            for row in rows {
                let key = key_columns
                    .iter()
                    .map(|c| format!("{:?}", row.get(c)))
                    .collect::<Vec<_>>()
                    .join("|");
                stored.insert(key, row.clone());
            }
            Ok(rows.len() as u64)
        })
    }
}
