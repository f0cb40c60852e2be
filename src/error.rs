use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageLockError {
    #[error("ledger at {path} exists but cannot be parsed: {source} (rerun with --fresh to start over)")]
    CorruptLedger {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist ledger to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Traversal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("action '{action}' failed for {path}: {message}")]
    ActionFailed {
        action: String,
        path: PathBuf,
        message: String,
    },

    #[error("scan root {path} cannot be read: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem watcher error: {0}")]
    WatcherError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),
}

impl ImageLockError {
    /// Whether this error ends the run rather than being folded into the
    /// pass statistics.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ImageLockError::Traversal { .. } | ImageLockError::ActionFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ImageLockError>;
