//! Subscription manager: owns the conversation and message feeds and keeps
//! them alive through transport failures.
//!
//! ```text
//! INIT ──start──▶ SUBSCRIBING ──ok──▶ SUBSCRIBED
//!                     │                   │ stream lost
//!                     └──fail──▶ RECONNECTING ◀┘
//!                                 │   │ timer fires
//!                     budget spent│   └──▶ SUBSCRIBING
//!                                 ▼
//!                               FAILED ──reconnect()──▶ SUBSCRIBING
//! ```
//!
//! Subscriptions are never patched: every (re)connect bumps a generation,
//! tears the old streams down and opens both streams from scratch. Reports
//! and timers from an older generation are ignored, so one outage yields one
//! retry no matter how many streams noticed it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use courier_proto::{FeedEvent, StreamKind};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::handler::{deliver_with_retry, panic_message, DeliveryOutcome, FeedHandler};
use crate::reconnect::{ChannelState, ReconnectState};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{FeedStream, FeedTransport, SubscribeRequest};

/// Counters kept by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Events handed to the handler successfully.
    pub events_delivered: u64,
    /// Events discarded by the operation or conversation filter.
    pub events_filtered: u64,
    /// Events dropped after the handler failed every attempt.
    pub events_dropped: u64,
    /// Extra handler attempts beyond the first.
    pub handler_retries: u64,
    /// Failed subscribe calls.
    pub subscribe_failures: u64,
    /// Streams that closed while subscribed.
    pub streams_lost: u64,
}

#[derive(Default)]
struct AtomicStats {
    events_delivered: AtomicU64,
    events_filtered: AtomicU64,
    events_dropped: AtomicU64,
    handler_retries: AtomicU64,
    subscribe_failures: AtomicU64,
    streams_lost: AtomicU64,
}

struct ManagerState {
    phase: ChannelState,
    reconnect: ReconnectState,
    generation: u64,
    pumps: Vec<JoinHandle<()>>,
    retry_timer: Option<TimerHandle>,
}

struct Inner {
    config: RealtimeConfig,
    transport: Arc<dyn FeedTransport>,
    handler: Arc<dyn FeedHandler>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<ManagerState>,
    state_tx: watch::Sender<ChannelState>,
    stats: AtomicStats,
}

/// Keeps the conversation and message subscriptions alive and forwards
/// matching events to a [`FeedHandler`].
///
/// Delivery is at-least-once as provided by the transport; nothing here
/// deduplicates. Dropping the manager is equivalent to [`stop`](Self::stop).
pub struct ChannelSubscriptionManager {
    inner: Arc<Inner>,
}

impl ChannelSubscriptionManager {
    /// Creates an idle manager in [`ChannelState::Init`].
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn FeedTransport>,
        handler: Arc<dyn FeedHandler>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Init);
        let reconnect = ReconnectState::new(config.reconnect.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                handler,
                scheduler,
                state: Mutex::new(ManagerState {
                    phase: ChannelState::Init,
                    reconnect,
                    generation: 0,
                    pumps: Vec::new(),
                    retry_timer: None,
                }),
                state_tx,
                stats: AtomicStats::default(),
            }),
        }
    }

    /// Tears down whatever exists and opens both subscriptions.
    ///
    /// On failure the manager is already in `Reconnecting` (or `Failed`) and a
    /// retry is scheduled; the error is returned for the caller's benefit.
    /// Refuses with [`RealtimeError::Failed`] while failed.
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut st = self.inner.state.lock().expect("lock poisoned");
            if st.phase == ChannelState::Failed {
                return Err(RealtimeError::Failed {
                    attempts: st.reconnect.attempt(),
                });
            }
            teardown(&mut st);
            st.generation += 1;
            self.inner.set_phase(&mut st, ChannelState::Subscribing);
            st.generation
        };
        Inner::open(&self.inner, generation).await
    }

    /// Tears down all subscriptions and cancels any pending retry.
    pub fn stop(&self) {
        let mut st = self.inner.state.lock().expect("lock poisoned");
        teardown(&mut st);
        // Invalidate in-flight opens and stale stream reports.
        st.generation += 1;
        if st.phase != ChannelState::Failed {
            self.inner.set_phase(&mut st, ChannelState::Init);
        }
        debug!(phase = %st.phase, "subscriptions stopped");
    }

    /// Resets the attempt counter and restarts from scratch, leaving `Failed`.
    pub async fn reconnect(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock().expect("lock poisoned");
            st.reconnect.reset();
            self.inner.set_phase(&mut st, ChannelState::Init);
            info!("manual reconnect requested");
        }
        self.stop();
        self.start().await
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().expect("lock poisoned").phase
    }

    /// Reconnect attempts spent since the last manual reconnect.
    pub fn attempts(&self) -> u32 {
        self.inner
            .state
            .lock()
            .expect("lock poisoned")
            .reconnect
            .attempt()
    }

    /// Whether a retry timer is armed.
    pub fn retry_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("lock poisoned")
            .retry_timer
            .is_some()
    }

    /// Watch channel of state transitions, for rendering a reconnect affordance.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ManagerStats {
        let s = &self.inner.stats;
        ManagerStats {
            events_delivered: s.events_delivered.load(Ordering::Relaxed),
            events_filtered: s.events_filtered.load(Ordering::Relaxed),
            events_dropped: s.events_dropped.load(Ordering::Relaxed),
            handler_retries: s.handler_retries.load(Ordering::Relaxed),
            subscribe_failures: s.subscribe_failures.load(Ordering::Relaxed),
            streams_lost: s.streams_lost.load(Ordering::Relaxed),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }
}

impl Drop for ChannelSubscriptionManager {
    fn drop(&mut self) {
        if let Ok(mut st) = self.inner.state.lock() {
            teardown(&mut st);
            st.generation += 1;
        }
    }
}

fn teardown(st: &mut ManagerState) {
    for pump in st.pumps.drain(..) {
        pump.abort();
    }
    if let Some(timer) = st.retry_timer.take() {
        timer.cancel();
    }
}

impl Inner {
    fn set_phase(&self, st: &mut ManagerState, phase: ChannelState) {
        if st.phase != phase {
            debug!(from = %st.phase, to = %phase, "channel state transition");
        }
        st.phase = phase;
        self.state_tx.send_replace(phase);
    }

    fn requests(&self) -> [SubscribeRequest; 2] {
        [
            SubscribeRequest {
                stream: StreamKind::Conversations,
                operations: self.config.conversation_operations.clone(),
                conversation_id: None,
            },
            SubscribeRequest {
                stream: StreamKind::Messages,
                operations: self.config.message_operations.clone(),
                conversation_id: self.config.conversation_filter.clone(),
            },
        ]
    }

    async fn open(inner: &Arc<Inner>, generation: u64) -> Result<()> {
        let [conversations, messages] = inner.requests();
        let opened: Result<(FeedStream, FeedStream)> = async {
            let c = inner.transport.subscribe(conversations).await?;
            let m = inner.transport.subscribe(messages).await?;
            Ok((c, m))
        }
        .await;

        let mut st = inner.state.lock().expect("lock poisoned");
        if st.generation != generation {
            debug!(generation, current = st.generation, "discarding superseded subscriptions");
            return Err(RealtimeError::Superseded);
        }

        match opened {
            Ok((conv_stream, msg_stream)) => {
                st.pumps.push(spawn_pump(inner, generation, StreamKind::Conversations, conv_stream));
                st.pumps.push(spawn_pump(inner, generation, StreamKind::Messages, msg_stream));
                inner.set_phase(&mut st, ChannelState::Subscribed);
                info!(generation, attempts = st.reconnect.attempt(), "feed subscriptions established");
                Ok(())
            }
            Err(e) => {
                inner.stats.subscribe_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "feed subscription failed");
                Inner::on_failure(inner, &mut st);
                Err(e)
            }
        }
    }

    fn on_failure(inner: &Arc<Inner>, st: &mut ManagerState) {
        teardown(st);
        match st.reconnect.advance_attempt() {
            None => {
                inner.set_phase(st, ChannelState::Failed);
                error!(
                    attempts = st.reconnect.attempt(),
                    "feed reconnect budget exhausted; waiting for manual reconnect"
                );
            }
            Some(delay) => {
                let attempt = st.reconnect.attempt();
                inner.set_phase(st, ChannelState::Reconnecting { attempt });
                let weak = Arc::downgrade(inner);
                let generation = st.generation;
                let timer = inner.scheduler.schedule(
                    delay,
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade() {
                            Inner::retry(&inner, generation).await;
                        }
                    }),
                );
                st.retry_timer = Some(timer);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "feed reconnect scheduled");
            }
        }
    }

    async fn retry(inner: &Arc<Inner>, scheduled_generation: u64) {
        let generation = {
            let mut st = inner.state.lock().expect("lock poisoned");
            if st.generation != scheduled_generation {
                return;
            }
            st.retry_timer = None;
            st.generation += 1;
            inner.set_phase(&mut st, ChannelState::Subscribing);
            st.generation
        };
        // Failures reschedule themselves inside open().
        let _ = Inner::open(inner, generation).await;
    }

    fn on_stream_closed(inner: &Arc<Inner>, generation: u64, stream: StreamKind) {
        let mut st = inner.state.lock().expect("lock poisoned");
        if st.generation != generation || st.phase != ChannelState::Subscribed {
            return;
        }
        inner.stats.streams_lost.fetch_add(1, Ordering::Relaxed);
        warn!(%stream, generation, "feed stream lost");
        Inner::on_failure(inner, &mut st);
    }

    async fn route(&self, event: FeedEvent) {
        let accepted = match event.stream() {
            StreamKind::Conversations => self.config.conversation_operations.matches(event.operation),
            StreamKind::Messages => {
                self.config.message_operations.matches(event.operation)
                    && self
                        .config
                        .conversation_filter
                        .as_ref()
                        .map_or(true, |c| c == event.conversation_id())
            }
        };
        if !accepted {
            self.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match deliver_with_retry(
            &self.handler,
            &event,
            &self.config.handler_retry,
            &self.scheduler,
        )
        .await
        {
            DeliveryOutcome::Delivered { attempts } => {
                self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .handler_retries
                    .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
            }
            DeliveryOutcome::Dropped { attempts } => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .handler_retries
                    .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
            }
        }
    }
}

fn spawn_pump(
    inner: &Arc<Inner>,
    generation: u64,
    stream: StreamKind,
    mut events: FeedStream,
) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let drained = AssertUnwindSafe(async {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                inner.route(event).await;
            }
            true
        })
        .catch_unwind()
        .await;
        match drained {
            // Manager dropped while routing.
            Ok(false) => return,
            Ok(true) => {}
            Err(payload) => {
                error!(%stream, generation, panic = panic_message(&*payload), "feed pump panicked");
            }
        }
        // Either way the stream is gone: report it so a retry is armed.
        if let Some(inner) = weak.upgrade() {
            Inner::on_stream_closed(&inner, generation, stream);
        }
    })
}
