//! System-level notification surface.

use async_trait::async_trait;
use courier_proto::{ConversationId, MessageId};
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, Result};

/// A notification ready to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedNotification {
    /// Message the notification is about.
    pub message_id: MessageId,
    /// Conversation of that message.
    pub conversation_id: ConversationId,
    /// Heading line.
    pub title: String,
    /// Body text, already truncated.
    pub body: String,
}

/// Where system notifications go. Any error makes the coordinator fall back
/// to an in-app event.
#[async_trait]
pub trait NotificationSurface: Send + Sync {
    /// Renders `notification`.
    async fn show(&self, notification: &RenderedNotification) -> Result<()>;
}

/// Surface for hosts without system notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSurface;

#[async_trait]
impl NotificationSurface for NoSurface {
    async fn show(&self, _notification: &RenderedNotification) -> Result<()> {
        Err(NotifyError::SurfaceUnavailable(
            "no system notification surface".to_string(),
        ))
    }
}
