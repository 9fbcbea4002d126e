//! Error types for the sharding library.

use std::fmt;

use thiserror::Error;

use crate::topology::ShardId;

/// Main error type for sharding operations.
#[derive(Error, Debug)]
pub enum ShardError {
    /// Configuration error (invalid YAML, malformed topology, overlapping buckets, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key could not be routed (unsupported key type, empty topology, empty target set)
    #[error("Routing error: {0}")]
    Routing(String),

    /// A shard id that is not part of the topology
    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    /// Connection failure or timeout for a specific shard
    #[error("Shard {shard} unavailable: {message}")]
    ShardUnavailable { shard: ShardId, message: String },

    /// Query or command rejected by a specific shard
    #[error("Query failed on shard {shard}: {message}")]
    Query { shard: ShardId, message: String },

    /// Scatter-gather finished below the configured minimum of healthy shards
    #[error("Insufficient healthy shards: {succeeded} succeeded, {required} required ({})", FailureList(.failures))]
    PartialFailure {
        succeeded: usize,
        required: usize,
        failures: Vec<(ShardId, ShardFailure)>,
    },

    /// Re-applying an applied migration or rolling back a non-applied one
    #[error("Migration conflict for {migration} on shard {shard}: {message}")]
    MigrationConflict {
        shard: ShardId,
        migration: String,
        message: String,
    },

    /// Non-empty diff between shard snapshots
    #[error("Schema drift detected: {} finding(s)", .findings.len())]
    SchemaDriftDetected {
        findings: Vec<crate::schema::SchemaDrift>,
    },

    /// Reference table write failed on some shards
    #[error("Replication of {table} failed on {} shard(s) ({})", .failures.len(), FailureList(.failures))]
    ReplicationPartialFailure {
        table: String,
        failures: Vec<(ShardId, ShardFailure)>,
    },

    /// Migration ledger read/write error
    #[error("Migration history error: {0}")]
    History(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShardError {
    /// Create a ShardUnavailable error.
    pub fn unavailable(shard: &ShardId, message: impl Into<String>) -> Self {
        ShardError::ShardUnavailable {
            shard: shard.clone(),
            message: message.into(),
        }
    }

    /// Create a Query error.
    pub fn query(shard: &ShardId, message: impl Into<String>) -> Self {
        ShardError::Query {
            shard: shard.clone(),
            message: message.into(),
        }
    }

    /// Create a MigrationConflict error.
    pub fn conflict(
        shard: &ShardId,
        migration: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ShardError::MigrationConflict {
            shard: shard.clone(),
            migration: migration.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the shard could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ShardError::ShardUnavailable { .. })
    }

    /// Process exit code for command-line tools.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShardError::Config(_) | ShardError::Yaml(_) => 2,
            ShardError::SchemaDriftDetected { .. } => 3,
            ShardError::PartialFailure { .. } | ShardError::ReplicationPartialFailure { .. } => 4,
            ShardError::ShardUnavailable { .. } => 5,
            ShardError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        match self {
            ShardError::PartialFailure { failures, .. }
            | ShardError::ReplicationPartialFailure { failures, .. } => {
                for (shard, failure) in failures {
                    output.push_str(&format!("\n  {}: {}", shard, failure));
                }
            }
            ShardError::SchemaDriftDetected { findings } => {
                for finding in findings {
                    output.push_str(&format!("\n  {}", finding));
                }
            }
            _ => {}
        }

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Classification of a single shard's failure inside a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection could not be opened.
    Unavailable,
    /// The per-shard timeout elapsed.
    Timeout,
    /// The shard rejected the query or command.
    Query,
    /// The unit was cancelled before it completed.
    Cancelled,
    /// The unit panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Unavailable => "unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::Query => "query",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

/// A per-shard failure captured as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ShardFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error returned while working against a shard.
    pub fn from_error(err: &ShardError) -> Self {
        let kind = match err {
            ShardError::ShardUnavailable { .. } => FailureKind::Unavailable,
            ShardError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Query,
        };
        Self::new(kind, err.to_string())
    }

    /// Convert back into a ShardError attributed to `shard`.
    pub fn into_error(self, shard: &ShardId) -> ShardError {
        match self.kind {
            FailureKind::Unavailable | FailureKind::Timeout => {
                ShardError::unavailable(shard, self.message)
            }
            FailureKind::Cancelled => ShardError::Cancelled,
            FailureKind::Query | FailureKind::Panicked => ShardError::query(shard, self.message),
        }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

struct FailureList<'a>(&'a [(ShardId, ShardFailure)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (shard, failure)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", shard, failure)?;
        }
        Ok(())
    }
}

/// Result type alias for sharding operations.
pub type Result<T> = std::result::Result<T, ShardError>;
