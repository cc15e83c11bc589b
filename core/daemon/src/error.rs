//! Error types for the reconciliation core.

use std::path::PathBuf;

/// Registry-level failures. Unknown keys are not errors; lookups return `None`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session already active: {session_key}")]
    AlreadyActive { session_key: String },

    #[error("Session finalized but not yet persisted: {session_key}")]
    PendingFinalize { session_key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    // ─────────────────────────────────────────────────────────────────────
    // Record Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("In-progress record already exists for session {session_key} (record {record_id})")]
    DuplicateSession { session_key: String, record_id: i64 },

    #[error("Activity record not found: {0}")]
    RecordNotFound(i64),

    #[error("Corrupt activity row: {0}")]
    InvalidRow(String),

    // ─────────────────────────────────────────────────────────────────────
    // Backend Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("SQLite error: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn sqlite(context: &str, source: rusqlite::Error) -> Self {
        StoreError::Sqlite {
            context: context.to_string(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel rejected delivery: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
