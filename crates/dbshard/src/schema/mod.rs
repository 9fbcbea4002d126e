//! Schema snapshots and drift detection between shards.
//!
//! Every shard is expected to carry the same tables, columns and indexes;
//! only the data is partitioned. [`diff`] reports any structural divergence
//! between two snapshots in both directions. Findings are surfaced to an
//! operator and never repaired here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ShardedConnectionFactory;
use crate::core::TableSchema;
use crate::error::{Result, ShardError, ShardFailure};
use crate::scatter::{ScatterGatherOptions, ShardTargets, ShardedQueryExecutor};
use crate::topology::ShardId;

/// One column as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// One index as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Point-in-time DDL state of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub shard_id: ShardId,
    pub taken_at: DateTime<Utc>,

    /// Table name → columns in ordinal order.
    pub tables: BTreeMap<String, Vec<ColumnDescriptor>>,

    pub indexes: BTreeSet<IndexDescriptor>,
}

impl SchemaSnapshot {
    /// Build a snapshot from catalog metadata read off `shard_id`.
    pub fn from_catalog(shard_id: ShardId, catalog: Vec<TableSchema>) -> Self {
        let mut tables = BTreeMap::new();
        let mut indexes = BTreeSet::new();

        for table in catalog {
            let name = table.full_name();
            let mut columns = table.columns;
            columns.sort_by_key(|c| c.ordinal_pos);

            for index in table.indexes {
                indexes.insert(IndexDescriptor {
                    table: name.clone(),
                    name: index.name,
                    columns: index.columns,
                    unique: index.is_unique,
                });
            }

            tables.insert(
                name,
                columns
                    .into_iter()
                    .map(|c| ColumnDescriptor {
                        name: c.name,
                        data_type: normalize_type(&c.data_type),
                        nullable: c.is_nullable,
                    })
                    .collect(),
            );
        }

        Self {
            shard_id,
            taken_at: Utc::now(),
            tables,
            indexes,
        }
    }

    /// Load a snapshot saved with [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the snapshot as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn indexes_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexDescriptor> + 'a {
        self.indexes.iter().filter(move |i| i.table == table)
    }
}

fn normalize_type(data_type: &str) -> String {
    data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Kind of structural divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    MissingTable,
    MissingColumn,
    /// Column type or nullability differs.
    TypeMismatch,
    IndexMismatch,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftKind::MissingTable => "missing table",
            DriftKind::MissingColumn => "missing column",
            DriftKind::TypeMismatch => "type mismatch",
            DriftKind::IndexMismatch => "index mismatch",
        };
        f.write_str(s)
    }
}

/// One structural integrity finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDrift {
    pub table: String,
    pub kind: DriftKind,
    pub detail: String,
}

impl fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.table, self.kind, self.detail)
    }
}

/// Compare two snapshots, reporting divergence in both directions.
///
/// Findings are ordered by table name. Indexes are only compared for tables
/// present on both sides.
///
/// Table, column and index names are compared exactly as the catalog reports
/// them: `Email` and `email` are different columns. Only data types are
/// case-normalized.
pub fn diff(a: &SchemaSnapshot, b: &SchemaSnapshot) -> Vec<SchemaDrift> {
    let mut findings = Vec::new();
    let names: BTreeSet<&String> = a.tables.keys().chain(b.tables.keys()).collect();

    for table in names {
        let drift = |kind, detail: String| SchemaDrift {
            table: table.clone(),
            kind,
            detail,
        };

        let (cols_a, cols_b) = match (a.tables.get(table), b.tables.get(table)) {
            (Some(x), Some(y)) => (x, y),
            (Some(_), None) => {
                findings.push(drift(
                    DriftKind::MissingTable,
                    format!("present on {}, missing on {}", a.shard_id, b.shard_id),
                ));
                continue;
            }
            (None, Some(_)) => {
                findings.push(drift(
                    DriftKind::MissingTable,
                    format!("present on {}, missing on {}", b.shard_id, a.shard_id),
                ));
                continue;
            }
            (None, None) => continue,
        };

        let by_name_b: BTreeMap<&str, &ColumnDescriptor> =
            cols_b.iter().map(|c| (c.name.as_str(), c)).collect();
        let by_name_a: BTreeMap<&str, &ColumnDescriptor> =
            cols_a.iter().map(|c| (c.name.as_str(), c)).collect();

        for col in cols_a {
            match by_name_b.get(col.name.as_str()) {
                None => findings.push(drift(
                    DriftKind::MissingColumn,
                    format!(
                        "column '{}' present on {}, missing on {}",
                        col.name, a.shard_id, b.shard_id
                    ),
                )),
                Some(other) => {
                    if col.data_type != other.data_type {
                        findings.push(drift(
                            DriftKind::TypeMismatch,
                            format!(
                                "column '{}' is {} on {}, {} on {}",
                                col.name, col.data_type, a.shard_id, other.data_type, b.shard_id
                            ),
                        ));
                    }
                    if col.nullable != other.nullable {
                        findings.push(drift(
                            DriftKind::TypeMismatch,
                            format!(
                                "column '{}' is {} on {}, {} on {}",
                                col.name,
                                nullability(col.nullable),
                                a.shard_id,
                                nullability(other.nullable),
                                b.shard_id
                            ),
                        ));
                    }
                }
            }
        }
        for col in cols_b {
            if !by_name_a.contains_key(col.name.as_str()) {
                findings.push(drift(
                    DriftKind::MissingColumn,
                    format!(
                        "column '{}' present on {}, missing on {}",
                        col.name, b.shard_id, a.shard_id
                    ),
                ));
            }
        }

        let idx_a: BTreeMap<&str, &IndexDescriptor> =
            a.indexes_of(table).map(|i| (i.name.as_str(), i)).collect();
        let idx_b: BTreeMap<&str, &IndexDescriptor> =
            b.indexes_of(table).map(|i| (i.name.as_str(), i)).collect();

        for (name, ia) in &idx_a {
            match idx_b.get(name) {
                None => findings.push(drift(
                    DriftKind::IndexMismatch,
                    format!(
                        "index '{}' present on {}, missing on {}",
                        name, a.shard_id, b.shard_id
                    ),
                )),
                Some(ib) if ia.columns != ib.columns || ia.unique != ib.unique => {
                    findings.push(drift(
                        DriftKind::IndexMismatch,
                        format!(
                            "index '{}' is {} on {}, {} on {}",
                            name,
                            describe_index(ia),
                            a.shard_id,
                            describe_index(ib),
                            b.shard_id
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        for name in idx_b.keys() {
            if !idx_a.contains_key(name) {
                findings.push(drift(
                    DriftKind::IndexMismatch,
                    format!(
                        "index '{}' present on {}, missing on {}",
                        name, b.shard_id, a.shard_id
                    ),
                ));
            }
        }
    }

    findings
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "nullable"
    } else {
        "not null"
    }
}

fn describe_index(index: &IndexDescriptor) -> String {
    format!(
        "{}({})",
        if index.unique { "unique " } else { "" },
        index.columns.join(", ")
    )
}

/// Result of comparing a set of shards against a baseline shard.
#[derive(Debug, Clone)]
pub struct DriftReport {
    /// Shard every other snapshot was compared with.
    pub baseline: ShardId,

    /// Shards that were snapshotted and compared, in topology order.
    pub compared: Vec<ShardId>,

    pub findings: Vec<SchemaDrift>,

    /// Shards whose catalog could not be read.
    pub unavailable: Vec<(ShardId, ShardFailure)>,
}

impl DriftReport {
    /// No structural divergence among the shards that were read.
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }

    /// Every targeted shard was read.
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// Turn a non-empty report into `SchemaDriftDetected`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_consistent() {
            Ok(self)
        } else {
            Err(ShardError::SchemaDriftDetected {
                findings: self.findings,
            })
        }
    }
}

/// Reads live schema metadata from shards.
pub struct SchemaIntrospector {
    factory: ShardedConnectionFactory,
    executor: ShardedQueryExecutor,
    options: ScatterGatherOptions,
}

impl SchemaIntrospector {
    pub fn new(factory: ShardedConnectionFactory) -> Self {
        let options = ScatterGatherOptions::best_effort(1);
        Self {
            executor: ShardedQueryExecutor::new(factory.clone(), options.clone()),
            factory,
            options,
        }
    }

    /// Concurrency and timeout for [`verify_cluster`](Self::verify_cluster).
    /// The failure policy is always best-effort with at least one shard.
    pub fn with_options(mut self, options: ScatterGatherOptions) -> Self {
        self.options = ScatterGatherOptions {
            min_successful_shards: 1,
            failure_policy: crate::scatter::FailurePolicy::BestEffort,
            ..options
        };
        self
    }

    /// Take a fresh snapshot of one shard.
    pub async fn snapshot(&self, shard: &ShardId) -> Result<SchemaSnapshot> {
        let mut conn = self.factory.open(shard).await?;
        let catalog = conn.read_catalog().await?;
        Ok(SchemaSnapshot::from_catalog(shard.clone(), catalog))
    }

    /// Snapshot `targets` concurrently and diff each against the first
    /// readable shard in topology order.
    pub async fn verify_cluster(
        &self,
        targets: ShardTargets,
        cancel: &CancellationToken,
    ) -> Result<DriftReport> {
        let outcome = self
            .executor
            .scatter(targets, &self.options, cancel, |shard, conn| {
                async move {
                    let mut conn = conn;
                    let catalog = conn.read_catalog().await?;
                    Ok(SchemaSnapshot::from_catalog(shard.id, catalog))
                }
                .boxed()
            })
            .await?;

        let unavailable = outcome.failures();
        let snapshots: Vec<SchemaSnapshot> =
            outcome.results.into_iter().filter_map(|r| r.value).collect();

        let Some((baseline, rest)) = snapshots.split_first() else {
            return Err(ShardError::Routing("no shard catalog could be read".into()));
        };

        let mut findings = Vec::new();
        for snapshot in rest {
            findings.extend(diff(baseline, snapshot));
        }

        if findings.is_empty() {
            info!(
                "Schema verified on {} shard(s) against {}: no drift",
                snapshots.len(),
                baseline.shard_id
            );
        } else {
            for finding in &findings {
                warn!("Schema drift: {}", finding);
            }
        }

        Ok(DriftReport {
            baseline: baseline.shard_id.clone(),
            compared: snapshots.iter().map(|s| s.shard_id.clone()).collect(),
            findings,
            unavailable,
        })
    }
}
