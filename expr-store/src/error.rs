use mmap_util::MapError;
use thiserror::Error;

/// Error kinds for store operations.
///
/// Set-algebra and graph-creation name collisions are not errors; those
/// paths return `Ok(false)` with a diagnostic. Everything here is a real
/// failure that propagates to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<MapError> for StoreError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::Io { .. } => StoreError::Io(e.to_string()),
            MapError::Corrupt { .. } => StoreError::Corrupt(e.to_string()),
            MapError::CapacityExhausted { .. } => StoreError::CapacityExhausted(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
