use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a conversation between an operator and a counterparty
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        ConversationId(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        ConversationId(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        ConversationId(s)
    }
}

/// Opaque identifier of a single message
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

/// Which side of a conversation authored a message
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// The console operator
    Operator,
    /// The party the operator is talking to
    Counterparty,
}

/// A message as stored by the data service. `content` is ciphertext at rest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// User id of the author
    pub sender_id: String,
    /// Which side authored the message
    pub sender_kind: SenderKind,
    /// Payload; ciphertext except while being processed
    pub content: String,
    /// Creation time as recorded by the data service
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read the message
    #[serde(default)]
    pub read: bool,
    /// Soft-delete flag
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    /// True when the message was authored by the given user id
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// A conversation thread between exactly two parties
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id
    pub id: ConversationId,
    /// User id of the operator side
    pub operator_id: String,
    /// User id of the counterparty side
    pub counterparty_id: String,
    /// Optional display title
    #[serde(default)]
    pub title: Option<String>,
    /// Last activity time
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = MessageId::from("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
        let conv: ConversationId = serde_json::from_str("\"c1\"").unwrap();
        assert_eq!(conv.as_str(), "c1");
    }

    #[test]
    fn test_sender_kind_is_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&SenderKind::Counterparty).unwrap(),
            "\"counterparty\""
        );
    }

    #[test]
    fn test_message_defaults_read_and_deleted() {
        let json = r#"{
            "id": "m1",
            "conversation_id": "c1",
            "sender_id": "u2",
            "sender_kind": "counterparty",
            "content": "abc",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(!msg.read);
        assert!(!msg.deleted);
        assert!(msg.is_from("u2"));
        assert!(!msg.is_from("u1"));
    }
}
