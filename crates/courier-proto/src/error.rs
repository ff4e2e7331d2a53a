//! Error types for the data service boundary

/// Errors surfaced by the external data service
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The service answered with `success: false`
    #[error("data service rejected the request: {0}")]
    Rejected(String),
    /// The service answered `success: true` without a payload
    #[error("data service returned an empty envelope")]
    EmptyEnvelope,
    /// The request never reached the service or the reply was unreadable
    #[error("data service unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
