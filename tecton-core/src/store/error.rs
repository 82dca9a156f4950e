//! Structured error types for partition storage.

use super::schema::SchemaError;
use super::PartitionKey;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet codec error: {0}")]
    Codec(String),

    #[error("partition {key} is corrupt: {reason}")]
    CorruptPartition { key: PartitionKey, reason: String },

    #[error("write conflict on partition {key}: {mode} expected version {expected:?}, found {found:?}")]
    PartitionWriteConflict {
        key: PartitionKey,
        mode: &'static str,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("rejected rows for partition {key}: {source}")]
    InvalidRows {
        key: PartitionKey,
        #[source]
        source: SchemaError,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that only affect the partition they were raised for.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::CorruptPartition { .. })
    }
}
