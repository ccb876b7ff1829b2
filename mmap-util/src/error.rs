use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the memory-mapped containers.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Magic number, file size, or object size did not match on re-open.
    #[error("corrupt mapped file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A fixed-capacity table is full, or a vector could not grow.
    #[error("capacity exhausted in {path}: {reason}")]
    CapacityExhausted { path: PathBuf, reason: String },
}

impl MapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MapError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MapError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn capacity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MapError::CapacityExhausted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MapError>;
