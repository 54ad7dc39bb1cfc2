//! Error types for the metadata cache.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Failed to open or create the database file.
    #[error("Failed to open cache database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Cache migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Cache query failed: {0}")]
    Query(String),

    /// Stored hierarchy could not be (de)serialized.
    #[error("Cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Failed to create cache directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cache schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl CacheError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
