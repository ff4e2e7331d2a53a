//! Error types for the courier-cipher subsystem

/// Errors raised while decoding a payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// Input is not valid base64
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    /// Decoded bytes are not valid UTF-8 (wrong key or not ciphertext)
    #[error("decoded payload is not valid UTF-8")]
    InvalidUtf8,
    /// Decoded text contains control characters, so the input was not ciphertext
    #[error("decoded payload contains control characters")]
    Implausible,
}

/// Result alias for codec operations
pub type Result<T> = std::result::Result<T, CipherError>;
