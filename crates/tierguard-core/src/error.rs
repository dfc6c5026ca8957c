//! Error types for the tier guard engine.
//!
//! A denied operation is not an error: it is the `allowed == false` branch of
//! [`crate::evaluator::PermissionDecision`]. The variants here cover the
//! conditions that stop an operation from running at all.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("backup of {} failed: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: Box<EngineError>,
    },

    #[error("refusing to act through symbolic link {}", .0.display())]
    SymlinkRefused(PathBuf),

    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("settings error: {0}")]
    Settings(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return EngineError::NotFound(path);
        }
        EngineError::Io { path, source }
    }

    /// Stable code used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BackupFailed { .. } => "backup_failed",
            Self::SymlinkRefused(_) => "symlink_refused",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Settings(_) => "settings",
        }
    }

    /// Expected conditions the CLI reports as a JSON payload rather than a
    /// raw failure.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::BackupFailed { .. }
                | Self::SymlinkRefused(_)
                | Self::LockTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
