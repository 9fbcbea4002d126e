//! Catalog metadata types for tables, columns and indexes.
//!
//! Drivers produce these from their dialect's catalog views; the rest of the
//! crate only ever sees this database-agnostic shape.

use serde::{Deserialize, Serialize};

/// Table metadata as read from a shard's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema name (may be empty for engines without schemas).
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions, in ordinal order.
    pub columns: Vec<ColumnDef>,

    /// Index definitions.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Data type including length/precision (e.g. "varchar(64)", "bigint").
    pub data_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,

    /// Indexed column names.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,
}
