use courier_proto::StreamKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("subscription to {stream} stream failed: {reason}")]
    Transport { stream: StreamKind, reason: String },

    #[error("channel failed after {attempts} reconnect attempts; reconnect() required")]
    Failed { attempts: u32 },

    #[error("start superseded by a newer start or stop")]
    Superseded,
}

impl RealtimeError {
    pub fn transport(stream: StreamKind, reason: impl Into<String>) -> Self {
        RealtimeError::Transport {
            stream,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
