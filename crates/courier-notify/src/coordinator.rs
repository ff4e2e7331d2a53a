//! Cross-instance notification coordinator.
//!
//! Every open instance of the client receives the same message-insert event.
//! The coordinator makes sure at most one of them renders a notification,
//! using an optimistic claim protocol:
//!
//! ```text
//!   live marker? ──yes──▶ deduped
//!        │no
//!   announce claim (bus, or claim record in the store)
//!        │
//!   wait grace period ──shutdown──▶ cancelled
//!        │
//!   sibling marker/claim? ──yes──▶ deduped-after-claim
//!        │no
//!   write marker (mirror + store, TTL) ──▶ preferences ──▶ surface / in-app
//! ```
//!
//! Claims are totally ordered by `(claimed_at_ms, instance_id)`. A sibling
//! claim that does not precede our own pending claim is ignored, so N
//! simultaneous claimants produce exactly one render. There is no lock: a
//! duplicate is still possible if a claim takes longer than the grace period
//! to reach a sibling.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_cipher::CipherCodec;
use courier_proto::{ConversationId, Message, MessageId};
use courier_realtime::{Scheduler, TimerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BroadcastBus, BusMessage, Claim, SubscriptionId};
use crate::config::NotifyConfig;
use crate::expiring::ExpiringMap;
use crate::marker::{claim_key, claim_prefix, seen_key, MarkerRecord, MarkerStore, MemoryMarkerStore};
use crate::preferences::{MemoryPreferenceStore, NotificationPreferences, PreferenceStore};
use crate::surface::{NoSurface, NotificationSurface, RenderedNotification};

const FALLBACK_TEXT: &str = "New message";
const OWN_TITLE: &str = "You";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Input to [`NotificationCoordinator::notify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Already-decoded text, preferred when present.
    #[serde(default)]
    pub processed_content: Option<String>,
    /// Content as received from the feed, decoded on demand.
    #[serde(default)]
    pub raw_content: Option<String>,
}

impl NotifyPayload {
    /// Payload for a message straight off the feed.
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: None,
            processed_content: None,
            raw_content: Some(message.content.clone()),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_processed_content(mut self, text: impl Into<String>) -> Self {
        self.processed_content = Some(text.into());
        self
    }
}

/// Why a notify call did not render a system notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuppressReason {
    /// A live marker existed before claiming.
    Deduped,
    /// A sibling's marker or earlier claim appeared during the grace period.
    DedupedAfterClaim,
    /// Notifications are disabled in preferences.
    Disabled,
    /// The system surface failed; an in-app event was emitted instead.
    InApp,
    /// The coordinator shut down during the grace period.
    Cancelled,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Deduped => "deduped",
            SuppressReason::DedupedAfterClaim => "deduped-after-claim",
            SuppressReason::Disabled => "disabled",
            SuppressReason::InApp => "in-app",
            SuppressReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one notify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyOutcome {
    /// True only when the system surface rendered.
    pub shown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SuppressReason>,
}

impl NotifyOutcome {
    fn shown() -> Self {
        Self {
            shown: true,
            reason: None,
        }
    }

    fn suppressed(reason: SuppressReason) -> Self {
        Self {
            shown: false,
            reason: Some(reason),
        }
    }
}

/// Emitted for every rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Rendered by the system surface.
    Shown(RenderedNotification),
    /// System surface unavailable; the host should render it in-app.
    InApp(RenderedNotification),
}

/// Counters kept by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub shown: u64,
    pub in_app: u64,
    pub deduped: u64,
    pub deduped_after_claim: u64,
    pub disabled: u64,
    pub cancelled: u64,
    pub storage_errors: u64,
    pub sweeps: u64,
}

#[derive(Default)]
struct AtomicStats {
    shown: AtomicU64,
    in_app: AtomicU64,
    deduped: AtomicU64,
    deduped_after_claim: AtomicU64,
    disabled: AtomicU64,
    cancelled: AtomicU64,
    storage_errors: AtomicU64,
    sweeps: AtomicU64,
}

/// Assembles a [`NotificationCoordinator`]. Unset collaborators default to
/// in-memory stores, no bus and [`NoSurface`].
pub struct CoordinatorBuilder {
    config: NotifyConfig,
    codec: CipherCodec,
    scheduler: Arc<dyn Scheduler>,
    bus: Option<Arc<dyn BroadcastBus>>,
    store: Arc<dyn MarkerStore>,
    preferences: Arc<dyn PreferenceStore>,
    surface: Arc<dyn NotificationSurface>,
    identity: Option<String>,
    instance_id: Option<String>,
}

impl CoordinatorBuilder {
    pub fn new(codec: CipherCodec, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config: NotifyConfig::default(),
            codec,
            scheduler,
            bus: None,
            store: Arc::new(MemoryMarkerStore::new()),
            preferences: Arc::new(MemoryPreferenceStore::default()),
            surface: Arc::new(NoSurface),
            identity: None,
            instance_id: None,
        }
    }

    pub fn config(mut self, config: NotifyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn marker_store(mut self, store: Arc<dyn MarkerStore>) -> Self {
        self.store = store;
        self
    }

    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn surface(mut self, surface: Arc<dyn NotificationSurface>) -> Self {
        self.surface = surface;
        self
    }

    /// User id of the signed-in caller; own messages are titled "You".
    pub fn identity(mut self, user_id: impl Into<String>) -> Self {
        self.identity = Some(user_id.into());
        self
    }

    /// Overrides the random instance id.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Builds the coordinator, subscribes it to the bus and arms the sweep.
    /// With a tokio-backed scheduler this must run inside a runtime.
    pub fn build(self) -> NotificationCoordinator {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let inner = Arc::new(Inner {
            config: self.config,
            instance_id,
            identity: self.identity,
            codec: self.codec,
            scheduler: self.scheduler,
            bus: self.bus,
            store: self.store,
            preferences: self.preferences,
            surface: self.surface,
            mirror: Mutex::new(ExpiringMap::new()),
            pending: DashMap::new(),
            events,
            shutdown: CancellationToken::new(),
            bus_subscription: Mutex::new(None),
            sweep_timer: Mutex::new(None),
            stats: AtomicStats::default(),
        });

        if let Some(bus) = &inner.bus {
            let weak = Arc::downgrade(&inner);
            let id = bus.subscribe(
                &inner.config.topic,
                Arc::new(move |message: &BusMessage| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_bus_message(message);
                    }
                }),
            );
            *inner.bus_subscription.lock().expect("lock poisoned") = Some(id);
        }
        Inner::arm_sweep(&inner);

        info!(
            instance = %inner.instance_id,
            bus = inner.bus.is_some(),
            grace_ms = inner.config.grace_ms,
            "notification coordinator started"
        );
        NotificationCoordinator { inner }
    }
}

struct Inner {
    config: NotifyConfig,
    instance_id: String,
    identity: Option<String>,
    codec: CipherCodec,
    scheduler: Arc<dyn Scheduler>,
    bus: Option<Arc<dyn BroadcastBus>>,
    store: Arc<dyn MarkerStore>,
    preferences: Arc<dyn PreferenceStore>,
    surface: Arc<dyn NotificationSurface>,
    /// In-memory mirror of live markers: message id -> owning instance.
    mirror: Mutex<ExpiringMap<MessageId, String>>,
    pending: DashMap<MessageId, Claim>,
    events: broadcast::Sender<NotificationEvent>,
    shutdown: CancellationToken,
    bus_subscription: Mutex<Option<SubscriptionId>>,
    sweep_timer: Mutex<Option<TimerHandle>>,
    stats: AtomicStats,
}

/// Decides, once across all instances sharing its bus and store, whether a
/// message produces a notification. Cheap to clone.
#[derive(Clone)]
pub struct NotificationCoordinator {
    inner: Arc<Inner>,
}

impl NotificationCoordinator {
    pub fn builder(codec: CipherCodec, scheduler: Arc<dyn Scheduler>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(codec, scheduler)
    }

    /// Runs the claim protocol for one message. Never fails; only the grace
    /// wait suspends, and it suspends this call alone.
    pub async fn notify(&self, payload: NotifyPayload) -> NotifyOutcome {
        let inner = &self.inner;
        let id = payload.message_id.clone();

        if inner.shutdown.is_cancelled() {
            return inner.finish(&id, SuppressReason::Cancelled);
        }

        let now = inner.scheduler.now_millis();
        if inner.has_live_marker(&id, now, None) {
            return inner.finish(&id, SuppressReason::Deduped);
        }

        let claim = Claim {
            message_id: id.clone(),
            instance_id: inner.instance_id.clone(),
            claimed_at_ms: now,
        };
        match inner.pending.entry(id.clone()) {
            // A call on this instance already holds the claim.
            Entry::Occupied(_) => return inner.finish(&id, SuppressReason::Deduped),
            Entry::Vacant(slot) => {
                slot.insert(claim.clone());
            }
        }
        let pending = PendingClaim {
            pending: &inner.pending,
            id: &id,
        };
        inner.announce(&claim);

        let grace = inner
            .scheduler
            .sleep(Duration::from_millis(inner.config.grace_ms));
        let cancelled = tokio::select! {
            _ = inner.shutdown.cancelled() => true,
            _ = grace => false,
        };
        if cancelled {
            drop(pending);
            return inner.finish(&id, SuppressReason::Cancelled);
        }

        let now = inner.scheduler.now_millis();
        let sibling = inner.has_live_marker(&id, now, Some(&claim));
        drop(pending);
        if sibling {
            return inner.finish(&id, SuppressReason::DedupedAfterClaim);
        }

        inner.write_marker(&id, now);

        let prefs = inner.load_preferences();
        if !prefs.enabled {
            return inner.finish(&id, SuppressReason::Disabled);
        }

        let rendered = inner.render(&payload, &prefs);
        match inner.surface.show(&rendered).await {
            Ok(()) => {
                inner.stats.shown.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %id, "notification shown");
                let _ = inner.events.send(NotificationEvent::Shown(rendered));
                NotifyOutcome::shown()
            }
            Err(e) => {
                debug!(message_id = %id, error = %e, "system surface failed, falling back to in-app");
                let _ = inner.events.send(NotificationEvent::InApp(rendered));
                inner.finish(&id, SuppressReason::InApp)
            }
        }
    }

    /// Dispatch events; subscribe before notifying to see every one.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NotificationEvent> {
        self.inner.events.subscribe()
    }

    /// Abandons in-flight grace waits, stops the sweep and leaves the bus.
    /// Claims already announced stay announced.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        if let Some(timer) = inner.sweep_timer.lock().expect("lock poisoned").take() {
            timer.cancel();
        }
        if let (Some(bus), Some(id)) = (
            &inner.bus,
            inner.bus_subscription.lock().expect("lock poisoned").take(),
        ) {
            bus.unsubscribe(id);
        }
        info!(instance = %inner.instance_id, "notification coordinator shut down");
    }

    /// Drops expired entries from the in-memory mirror and the store.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Whether `id` currently counts as handled on this instance.
    pub fn is_handled(&self, id: &MessageId) -> bool {
        let now = self.inner.scheduler.now_millis();
        self.inner.has_live_marker(id, now, None)
    }

    /// Entries in the in-memory mirror, expired ones included until swept.
    pub fn mirror_len(&self) -> usize {
        self.inner.mirror.lock().expect("lock poisoned").len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let s = &self.inner.stats;
        CoordinatorStats {
            shown: s.shown.load(Ordering::Relaxed),
            in_app: s.in_app.load(Ordering::Relaxed),
            deduped: s.deduped.load(Ordering::Relaxed),
            deduped_after_claim: s.deduped_after_claim.load(Ordering::Relaxed),
            disabled: s.disabled.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            storage_errors: s.storage_errors.load(Ordering::Relaxed),
            sweeps: s.sweeps.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.inner.config
    }
}

impl Inner {
    fn finish(&self, id: &MessageId, reason: SuppressReason) -> NotifyOutcome {
        let counter = match reason {
            SuppressReason::Deduped => &self.stats.deduped,
            SuppressReason::DedupedAfterClaim => &self.stats.deduped_after_claim,
            SuppressReason::Disabled => &self.stats.disabled,
            SuppressReason::InApp => &self.stats.in_app,
            SuppressReason::Cancelled => &self.stats.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %id, reason = %reason, "notification suppressed");
        NotifyOutcome::suppressed(reason)
    }

    fn storage_error(&self, op: &str, error: &dyn fmt::Display) {
        self.stats.storage_errors.fetch_add(1, Ordering::Relaxed);
        warn!(op, error = %error, "marker store unavailable, using in-memory dedup only");
    }

    /// Mirror first, then the store's `seen:` marker, then sibling claim
    /// records. With `own` set, only claims that precede it count.
    fn has_live_marker(&self, id: &MessageId, now: u64, own: Option<&Claim>) -> bool {
        if self.mirror.lock().expect("lock poisoned").is_live(id, now) {
            return true;
        }

        match self.store.get(&seen_key(id)) {
            Ok(Some(record)) if record.is_live(now) => return true,
            Ok(_) => {}
            Err(e) => {
                self.storage_error("get", &e);
                return false;
            }
        }

        match self.store.scan(&claim_prefix(id)) {
            Ok(claims) => claims.into_iter().any(|(_, record)| {
                if record.owner == self.instance_id || !record.is_live(now) {
                    return false;
                }
                let sibling = Claim {
                    message_id: id.clone(),
                    instance_id: record.owner,
                    claimed_at_ms: record.written_at_ms,
                };
                own.map_or(true, |own| sibling.precedes(own))
            }),
            Err(e) => {
                self.storage_error("scan", &e);
                false
            }
        }
    }

    fn announce(&self, claim: &Claim) {
        if let Some(bus) = &self.bus {
            match bus.publish(&self.config.topic, BusMessage::Claim(claim.clone())) {
                Ok(reached) => {
                    debug!(message_id = %claim.message_id, reached, "claim announced");
                    return;
                }
                Err(e) => warn!(error = %e, "claim broadcast failed, recording claim in store"),
            }
        }
        let record = MarkerRecord {
            owner: claim.instance_id.clone(),
            written_at_ms: claim.claimed_at_ms,
            expires_at_ms: claim.claimed_at_ms + self.config.dedup_ttl_ms,
        };
        self.persist(claim_key(&claim.message_id, &claim.instance_id), record);
    }

    fn on_bus_message(&self, message: &BusMessage) {
        let BusMessage::Claim(claim) = message;
        if claim.instance_id == self.instance_id {
            return;
        }
        if let Some(own) = self.pending.get(&claim.message_id) {
            if !claim.precedes(&own) {
                debug!(
                    message_id = %claim.message_id,
                    sibling = %claim.instance_id,
                    "ignoring later sibling claim"
                );
                return;
            }
        }
        let now = self.scheduler.now_millis();
        let mut mirror = self.mirror.lock().expect("lock poisoned");
        if !mirror.is_live(&claim.message_id, now) {
            mirror.insert(
                claim.message_id.clone(),
                claim.instance_id.clone(),
                now + self.config.dedup_ttl_ms,
            );
            debug!(message_id = %claim.message_id, sibling = %claim.instance_id, "sibling claim observed");
        }
    }

    fn write_marker(&self, id: &MessageId, now: u64) {
        let expires_at_ms = now + self.config.dedup_ttl_ms;
        self.mirror.lock().expect("lock poisoned").insert(
            id.clone(),
            self.instance_id.clone(),
            expires_at_ms,
        );
        self.persist(
            seen_key(id),
            MarkerRecord {
                owner: self.instance_id.clone(),
                written_at_ms: now,
                expires_at_ms,
            },
        );
    }

    /// Writes `record` to the store and arms its self-expiry timer.
    fn persist(&self, key: String, record: MarkerRecord) {
        if let Err(e) = self.store.put(&key, &record) {
            self.storage_error("put", &e);
            return;
        }
        let now = self.scheduler.now_millis();
        let ttl = Duration::from_millis(record.expires_at_ms.saturating_sub(now));
        let store = self.store.clone();
        let deadline = record.expires_at_ms;
        // Expiry outlives the coordinator: markers must not stay behind.
        self.scheduler.schedule(
            ttl,
            Box::pin(async move {
                match store.get(&key) {
                    // Only remove the exact write this timer belongs to.
                    Ok(Some(current)) if current.expires_at_ms == deadline => {
                        if let Err(e) = store.remove(&key) {
                            warn!(key = %key, error = %e, "marker expiry failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(key = %key, error = %e, "marker expiry failed"),
                }
            }),
        );
    }

    fn load_preferences(&self) -> NotificationPreferences {
        match self.preferences.load() {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(error = %e, "preferences unreadable, using defaults");
                NotificationPreferences::default()
            }
        }
    }

    fn render(&self, payload: &NotifyPayload, prefs: &NotificationPreferences) -> RenderedNotification {
        let title = if self.identity.as_deref() == Some(payload.sender_id.as_str()) {
            OWN_TITLE.to_string()
        } else {
            payload
                .sender_name
                .clone()
                .unwrap_or_else(|| FALLBACK_TEXT.to_string())
        };

        let body = if prefs.preview {
            // Decoded for this render only; never stored or rebroadcast.
            let text = match (&payload.processed_content, &payload.raw_content) {
                (Some(text), _) => text.clone(),
                (None, Some(raw)) => self
                    .codec
                    .process_for_display(raw, &payload.conversation_id),
                (None, None) => String::new(),
            };
            truncate_preview(&text, self.config.max_preview_chars)
        } else {
            FALLBACK_TEXT.to_string()
        };

        RenderedNotification {
            message_id: payload.message_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            title,
            body,
        }
    }

    fn sweep(&self) -> usize {
        let now = self.scheduler.now_millis();
        let mut swept = self.mirror.lock().expect("lock poisoned").sweep(now);
        match self.store.purge_expired(now) {
            Ok(purged) => swept += purged,
            Err(e) => self.storage_error("purge", &e),
        }
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        if swept > 0 {
            debug!(swept, "expired dedup markers swept");
        }
        swept
    }

    fn arm_sweep(inner: &Arc<Inner>) {
        if inner.shutdown.is_cancelled() || inner.config.sweep_interval_ms == 0 {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let timer = inner.scheduler.schedule(
            Duration::from_millis(inner.config.sweep_interval_ms),
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    if !inner.shutdown.is_cancelled() {
                        inner.sweep();
                        Inner::arm_sweep(&inner);
                    }
                }
            }),
        );
        *inner.sweep_timer.lock().expect("lock poisoned") = Some(timer);
    }
}

/// Releases this instance's pending claim however `notify` ends, including
/// when its future is dropped mid-grace.
struct PendingClaim<'a> {
    pending: &'a DashMap<MessageId, Claim>,
    id: &'a MessageId,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}
