//! Push-feed transport boundary.
//!
//! A transport turns a [`SubscribeRequest`] into a stream of [`FeedEvent`]s.
//! The wire encoding belongs to the implementation; the manager only relies
//! on one rule: the stream closing while subscribed means the transport was
//! lost and a reconnect is due.

use std::sync::Mutex;

use async_trait::async_trait;
use courier_proto::{ConversationId, FeedEvent, OperationFilter, StreamKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RealtimeError, Result};

/// Receiving side of one subscription.
pub type FeedStream = mpsc::Receiver<FeedEvent>;

/// What a subscription wants from the feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Stream to follow.
    pub stream: StreamKind,
    /// Operations of interest.
    pub operations: OperationFilter,
    /// Restrict to one conversation. Transports may ignore this; the manager
    /// filters again on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl SubscribeRequest {
    /// Whether `event` falls inside this request.
    pub fn accepts(&self, event: &FeedEvent) -> bool {
        event.stream() == self.stream
            && self.operations.matches(event.operation)
            && self
                .conversation_id
                .as_ref()
                .map_or(true, |c| c == event.conversation_id())
    }
}

/// Source of push-feed subscriptions.
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    /// Opens a subscription. Errors are transport failures.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<FeedStream>;
}

struct Subscriber {
    request: SubscribeRequest,
    sender: mpsc::Sender<FeedEvent>,
}

#[derive(Default)]
struct FeedState {
    subscribers: Vec<Subscriber>,
    fail_next: u32,
    unavailable: bool,
    subscribe_calls: u64,
}

/// In-process feed: events published here reach every matching subscriber.
///
/// Also used to simulate outages: [`set_unavailable`](Self::set_unavailable)
/// makes `subscribe` fail and [`disconnect_all`](Self::disconnect_all) closes
/// every open stream.
pub struct InMemoryFeed {
    capacity: usize,
    state: Mutex<FeedState>,
}

impl InMemoryFeed {
    /// Creates a feed whose per-subscription buffers hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(FeedState::default()),
        }
    }

    /// Delivers `event` to every matching subscriber. Returns how many got it.
    pub async fn publish(&self, event: FeedEvent) -> usize {
        let targets: Vec<mpsc::Sender<FeedEvent>> = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.subscribers.retain(|s| !s.sender.is_closed());
            state
                .subscribers
                .iter()
                .filter(|s| s.request.accepts(&event))
                .map(|s| s.sender.clone())
                .collect()
        };
        let mut delivered = 0;
        for sender in targets {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(stream = %event.stream(), delivered, "feed event published");
        delivered
    }

    /// Closes every open stream, as if the connection dropped.
    pub fn disconnect_all(&self) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");
        let count = state.subscribers.len();
        state.subscribers.clear();
        warn!(count, "feed dropped all subscriptions");
        count
    }

    /// Makes the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.lock().expect("lock poisoned").fail_next = n;
    }

    /// Makes every subscribe call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().expect("lock poisoned").unavailable = unavailable;
    }

    /// Total subscribe calls, successful or not.
    pub fn subscribe_calls(&self) -> u64 {
        self.state.lock().expect("lock poisoned").subscribe_calls
    }

    /// Subscriptions whose receiver is still alive.
    pub fn active_subscriptions(&self) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl FeedTransport for InMemoryFeed {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<FeedStream> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.subscribe_calls += 1;
        if state.unavailable {
            return Err(RealtimeError::transport(request.stream, "feed unavailable"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RealtimeError::transport(request.stream, "injected failure"));
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        state.subscribers.push(Subscriber { request, sender });
        Ok(receiver)
    }
}
