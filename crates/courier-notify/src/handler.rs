//! Feed handler that turns message inserts into notify calls.

use async_trait::async_trait;
use courier_proto::Message;
use courier_realtime::FeedHandler;
use tracing::debug;

use crate::coordinator::{NotificationCoordinator, NotifyPayload};

/// Spawns [`NotificationCoordinator::notify`] for every inserted message, so
/// the grace period never holds up the feed.
#[derive(Clone)]
pub struct NotifyOnInsert {
    coordinator: NotificationCoordinator,
}

impl NotifyOnInsert {
    pub fn new(coordinator: NotificationCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl FeedHandler for NotifyOnInsert {
    async fn on_message_inserted(&self, message: &Message) -> anyhow::Result<()> {
        if message.deleted {
            return Ok(());
        }
        let coordinator = self.coordinator.clone();
        let payload = NotifyPayload::from_message(message);
        tokio::spawn(async move {
            let id = payload.message_id.clone();
            let outcome = coordinator.notify(payload).await;
            debug!(message_id = %id, shown = outcome.shown, reason = ?outcome.reason, "notify finished");
        });
        Ok(())
    }
}
