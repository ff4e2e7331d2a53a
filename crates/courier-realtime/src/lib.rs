#![warn(missing_docs)]

//! Courier realtime subsystem: push-feed subscriptions, reconnect state machine, handler retry

pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod reconnect;
pub mod scheduler;
pub mod transport;

pub use config::RealtimeConfig;
pub use error::RealtimeError;
pub use handler::{deliver_with_retry, DeliveryOutcome, FeedHandler, HandlerRetryConfig};
pub use manager::{ChannelSubscriptionManager, ManagerStats};
pub use reconnect::{ChannelState, ReconnectConfig, ReconnectState};
pub use scheduler::{ManualScheduler, Scheduler, TaskFuture, TimerHandle, TokioScheduler};
pub use transport::{FeedStream, FeedTransport, InMemoryFeed, SubscribeRequest};
