//! Boundary to the external data service (send and fetch paths).
//!
//! The service itself is out of scope; this module only fixes the shape of
//! its replies and the two calls the delivery core makes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::types::{ConversationId, Message, SenderKind};

/// `{success, data, error}` reply envelope used by the data service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Whether the service accepted the request
    pub success: bool,
    /// Payload on success
    #[serde(default)]
    pub data: Option<T>,
    /// Error description on failure
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// A successful envelope carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed envelope carrying an error description.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Unwraps the envelope into its payload.
    pub fn into_result(self) -> Result<T> {
        if !self.success {
            return Err(GatewayError::Rejected(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        self.data.ok_or(GatewayError::EmptyEnvelope)
    }

    /// Maps the payload, keeping success and error untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiEnvelope<U> {
        ApiEnvelope {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
        }
    }
}

/// A message about to be handed to the send path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Author user id
    pub sender_id: String,
    /// Author side
    pub sender_kind: SenderKind,
    /// Payload to store
    pub content: String,
}

/// Send/fetch surface of the data service.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Stores a new message and returns the stored row.
    async fn send_message(&self, draft: MessageDraft) -> ApiEnvelope<Message>;

    /// Reads the messages of one conversation, oldest first.
    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiEnvelope<Vec<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result_success() {
        assert_eq!(ApiEnvelope::ok(7).into_result().unwrap(), 7);
    }

    #[test]
    fn test_into_result_rejected() {
        let env: ApiEnvelope<u32> = ApiEnvelope::err("row level security");
        match env.into_result() {
            Err(GatewayError::Rejected(msg)) => assert_eq!(msg, "row level security"),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_into_result_empty() {
        let env: ApiEnvelope<u32> = ApiEnvelope {
            success: true,
            data: None,
            error: None,
        };
        assert!(matches!(env.into_result(), Err(GatewayError::EmptyEnvelope)));
    }

    #[test]
    fn test_envelope_parses_without_optional_fields() {
        let env: ApiEnvelope<u32> = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!env.success);
        assert!(env.error.is_none());
    }
}
