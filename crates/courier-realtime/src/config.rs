//! Subscription manager configuration

use courier_proto::{ConversationId, OperationFilter};
use serde::{Deserialize, Serialize};

use crate::handler::HandlerRetryConfig;
use crate::reconnect::ReconnectConfig;

/// Settings for [`ChannelSubscriptionManager`](crate::ChannelSubscriptionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Transport backoff.
    pub reconnect: ReconnectConfig,
    /// Handler retry on consumer-side failures.
    pub handler_retry: HandlerRetryConfig,
    /// When set, message events for other conversations are discarded.
    pub conversation_filter: Option<ConversationId>,
    /// Operations requested on the conversation stream.
    pub conversation_operations: OperationFilter,
    /// Operations requested on the message stream.
    pub message_operations: OperationFilter,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            handler_retry: HandlerRetryConfig::default(),
            conversation_filter: None,
            conversation_operations: OperationFilter::all(),
            message_operations: OperationFilter::all(),
        }
    }
}

impl RealtimeConfig {
    /// Restricts message delivery to one conversation.
    pub fn for_conversation(mut self, conversation: impl Into<ConversationId>) -> Self {
        self.conversation_filter = Some(conversation.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.handler_retry.max_attempts, 3);
        assert!(cfg.conversation_filter.is_none());
    }

    #[test]
    fn test_for_conversation() {
        let cfg = RealtimeConfig::default().for_conversation("c7");
        assert_eq!(cfg.conversation_filter.unwrap().as_str(), "c7");
    }
}
