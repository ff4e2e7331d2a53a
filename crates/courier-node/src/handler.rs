//! Feed handler wiring for the node.

use async_trait::async_trait;
use courier_notify::NotifyOnInsert;
use courier_proto::{Conversation, Message};
use courier_realtime::FeedHandler;
use tracing::info;

/// Logs conversation changes and forwards message inserts to the
/// notification coordinator.
pub struct NodeHandler {
    notify: NotifyOnInsert,
}

impl NodeHandler {
    pub fn new(notify: NotifyOnInsert) -> Self {
        Self { notify }
    }
}

#[async_trait]
impl FeedHandler for NodeHandler {
    async fn on_chat_created(&self, conversation: &Conversation) -> anyhow::Result<()> {
        info!(conversation = %conversation.id, "conversation created");
        Ok(())
    }

    async fn on_chat_updated(&self, conversation: &Conversation) -> anyhow::Result<()> {
        info!(conversation = %conversation.id, "conversation updated");
        Ok(())
    }

    async fn on_chat_deleted(&self, conversation: &Conversation) -> anyhow::Result<()> {
        info!(conversation = %conversation.id, "conversation deleted");
        Ok(())
    }

    async fn on_message_inserted(&self, message: &Message) -> anyhow::Result<()> {
        self.notify.on_message_inserted(message).await
    }
}
