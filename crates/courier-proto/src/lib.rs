#![warn(missing_docs)]

//! Courier protocol types: conversations, messages, push-feed events and the data service boundary

pub mod error;
pub mod feed;
pub mod gateway;
pub mod types;

pub use error::GatewayError;
pub use feed::{FeedEvent, FeedRecord, Operation, OperationFilter, StreamKind};
pub use gateway::{ApiEnvelope, MessageDraft, MessageGateway};
pub use types::{Conversation, ConversationId, Message, MessageId, SenderKind};
