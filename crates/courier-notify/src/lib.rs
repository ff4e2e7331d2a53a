#![warn(missing_docs)]

//! Courier notify subsystem: cross-instance claim protocol, dedup markers, preferences and dispatch

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expiring;
pub mod handler;
pub mod marker;
pub mod preferences;
pub mod surface;

pub use bus::{BroadcastBus, BusCallback, BusMessage, Claim, InProcessBus, SubscriptionId};
pub use config::NotifyConfig;
pub use coordinator::{
    CoordinatorBuilder, CoordinatorStats, NotificationCoordinator, NotificationEvent,
    NotifyOutcome, NotifyPayload, SuppressReason,
};
pub use error::NotifyError;
pub use expiring::ExpiringMap;
pub use handler::NotifyOnInsert;
pub use marker::{FileMarkerStore, MarkerRecord, MarkerStore, MemoryMarkerStore};
pub use preferences::{
    FilePreferenceStore, MemoryPreferenceStore, NotificationPreferences, PreferenceStore,
};
pub use surface::{NoSurface, NotificationSurface, RenderedNotification};
