use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broadcast bus error: {0}")]
    Bus(String),

    #[error("notification surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("notification permission denied")]
    PermissionDenied,
}

pub type Result<T> = std::result::Result<T, NotifyError>;
