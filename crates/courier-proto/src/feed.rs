//! Push-feed change events.
//!
//! On the wire an event is a flat object
//! `{"operation": "insert", "stream": "message", "record": {...}}`; in memory
//! the record is typed by its stream.

use serde::{Deserialize, Serialize};

use crate::types::{Conversation, ConversationId, Message};

/// Kind of change carried by a feed event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A record was created.
    Insert,
    /// A record was modified.
    Update,
    /// A record was removed.
    Delete,
}

/// The change stream an event belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Conversation create/update/delete changes.
    #[serde(rename = "conversation")]
    Conversations,
    /// Message create/update/delete changes.
    #[serde(rename = "message")]
    Messages,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Conversations => write!(f, "conversation"),
            StreamKind::Messages => write!(f, "message"),
        }
    }
}

/// The record attached to a feed event.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedRecord {
    /// A conversation row.
    Conversation(Conversation),
    /// A message row.
    Message(Message),
}

/// One change notification delivered by the push feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireFeedEvent", into = "WireFeedEvent")]
pub struct FeedEvent {
    /// What happened to the record.
    pub operation: Operation,
    /// The record itself.
    pub record: FeedRecord,
}

impl FeedEvent {
    /// Builds a message-stream event.
    pub fn message(operation: Operation, message: Message) -> Self {
        Self {
            operation,
            record: FeedRecord::Message(message),
        }
    }

    /// Builds a conversation-stream event.
    pub fn conversation(operation: Operation, conversation: Conversation) -> Self {
        Self {
            operation,
            record: FeedRecord::Conversation(conversation),
        }
    }

    /// The stream this event was published on.
    pub fn stream(&self) -> StreamKind {
        match self.record {
            FeedRecord::Conversation(_) => StreamKind::Conversations,
            FeedRecord::Message(_) => StreamKind::Messages,
        }
    }

    /// Conversation the record belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match &self.record {
            FeedRecord::Conversation(c) => &c.id,
            FeedRecord::Message(m) => &m.conversation_id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFeedEvent {
    operation: Operation,
    stream: StreamKind,
    record: serde_json::Value,
}

impl TryFrom<WireFeedEvent> for FeedEvent {
    type Error = serde_json::Error;

    fn try_from(wire: WireFeedEvent) -> Result<Self, Self::Error> {
        let record = match wire.stream {
            StreamKind::Conversations => {
                FeedRecord::Conversation(serde_json::from_value(wire.record)?)
            }
            StreamKind::Messages => FeedRecord::Message(serde_json::from_value(wire.record)?),
        };
        Ok(FeedEvent {
            operation: wire.operation,
            record,
        })
    }
}

impl From<FeedEvent> for WireFeedEvent {
    fn from(event: FeedEvent) -> Self {
        let stream = event.stream();
        // Both record types are plain data structs; serializing them to a Value cannot fail.
        let record = match event.record {
            FeedRecord::Conversation(c) => serde_json::to_value(c),
            FeedRecord::Message(m) => serde_json::to_value(m),
        }
        .unwrap_or(serde_json::Value::Null);
        WireFeedEvent {
            operation: event.operation,
            stream,
            record,
        }
    }
}

/// The set of operations a subscription is interested in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationFilter {
    operations: Vec<Operation>,
}

impl OperationFilter {
    /// Accepts insert, update and delete.
    pub fn all() -> Self {
        Self {
            operations: vec![Operation::Insert, Operation::Update, Operation::Delete],
        }
    }

    /// Accepts a single operation.
    pub fn only(op: Operation) -> Self {
        Self {
            operations: vec![op],
        }
    }

    /// Returns true if `op` passes the filter.
    pub fn matches(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }

    /// Operations accepted by this filter.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self::all()
    }
}
