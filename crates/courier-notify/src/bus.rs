//! Publish/subscribe primitive shared by every instance of the client.
//!
//! The claim protocol only needs fire-and-forget delivery to siblings; the
//! bus makes no ordering or durability promises. [`InProcessBus`] covers
//! instances that live in one process (and tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use courier_proto::MessageId;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;

/// Announcement that an instance intends to render a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Message being claimed.
    pub message_id: MessageId,
    /// Claiming instance.
    pub instance_id: String,
    /// Claim time on the claimant's clock.
    pub claimed_at_ms: u64,
}

impl Claim {
    /// Total order over claims for one message: earlier wins, instance id
    /// breaks ties.
    pub fn precedes(&self, other: &Claim) -> bool {
        (self.claimed_at_ms, self.instance_id.as_str())
            < (other.claimed_at_ms, other.instance_id.as_str())
    }
}

/// Messages carried on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A notification claim.
    Claim(Claim),
}

/// Handle returned by [`BroadcastBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Subscriber callback. Runs on the publisher's task; keep it short.
pub type BusCallback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Topic-based broadcast shared between client instances.
pub trait BroadcastBus: Send + Sync {
    /// Delivers `message` to every subscriber of `topic`, the publisher's own
    /// subscriptions included. Returns the number of subscribers reached.
    fn publish(&self, topic: &str, message: BusMessage) -> Result<usize>;

    /// Registers `callback` for `topic`.
    fn subscribe(&self, topic: &str, callback: BusCallback) -> SubscriptionId;

    /// Removes a subscription. Returns false if it was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

struct Registration {
    topic: String,
    callback: BusCallback,
}

/// Bus whose subscribers all live in this process. Delivery is synchronous.
#[derive(Default)]
pub struct InProcessBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriptionId, Registration>>,
}

impl InProcessBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }
}

impl BroadcastBus for InProcessBus {
    fn publish(&self, topic: &str, message: BusMessage) -> Result<usize> {
        // Callbacks run outside the lock so they may publish or unsubscribe.
        let targets: Vec<BusCallback> = {
            let subs = self.subscribers.read().expect("lock poisoned");
            subs.values()
                .filter(|r| r.topic == topic)
                .map(|r| r.callback.clone())
                .collect()
        };
        for callback in &targets {
            callback(&message);
        }
        trace!(topic, delivered = targets.len(), "bus message published");
        Ok(targets.len())
    }

    fn subscribe(&self, topic: &str, callback: BusCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().expect("lock poisoned").insert(
            id,
            Registration {
                topic: topic.to_string(),
                callback,
            },
        );
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .write()
            .expect("lock poisoned")
            .remove(&id)
            .is_some()
    }
}
