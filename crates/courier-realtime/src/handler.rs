//! Caller-supplied event handlers and the bounded retry around them.
//!
//! Handler failures are consumer-side and transient: the same event is
//! offered again after a short fixed delay, never with the transport backoff.
//! Once the attempts are spent the event is dropped and the next one flows.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_proto::{Conversation, FeedEvent, FeedRecord, Message, Operation};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::scheduler::Scheduler;

/// Callbacks invoked for feed events that pass the subscription filters.
///
/// Every callback defaults to a no-op so a host only implements what it uses.
#[async_trait]
pub trait FeedHandler: Send + Sync + 'static {
    /// A conversation was created.
    async fn on_chat_created(&self, _conversation: &Conversation) -> anyhow::Result<()> {
        Ok(())
    }

    /// A conversation was updated.
    async fn on_chat_updated(&self, _conversation: &Conversation) -> anyhow::Result<()> {
        Ok(())
    }

    /// A conversation was deleted.
    async fn on_chat_deleted(&self, _conversation: &Conversation) -> anyhow::Result<()> {
        Ok(())
    }

    /// A message was inserted. Hosts that notify should spawn the notify call
    /// rather than await it, so the claim grace period does not hold up the feed.
    async fn on_message_inserted(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// A message was updated (read flag, soft delete, edit).
    async fn on_message_updated(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// A message was hard-deleted.
    async fn on_message_deleted(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Retry settings for handler failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerRetryConfig {
    /// Total attempts per event, first delivery included.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,
}

impl Default for HandlerRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Outcome of offering one event to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler accepted the event after `attempts` tries.
    Delivered { attempts: u32 },
    /// Every attempt failed; the event was dropped.
    Dropped { attempts: u32 },
}

async fn dispatch(handler: &dyn FeedHandler, event: &FeedEvent) -> anyhow::Result<()> {
    match (&event.record, event.operation) {
        (FeedRecord::Conversation(c), Operation::Insert) => handler.on_chat_created(c).await,
        (FeedRecord::Conversation(c), Operation::Update) => handler.on_chat_updated(c).await,
        (FeedRecord::Conversation(c), Operation::Delete) => handler.on_chat_deleted(c).await,
        (FeedRecord::Message(m), Operation::Insert) => handler.on_message_inserted(m).await,
        (FeedRecord::Message(m), Operation::Update) => handler.on_message_updated(m).await,
        (FeedRecord::Message(m), Operation::Delete) => handler.on_message_deleted(m).await,
    }
}

/// Runs one callback; a panicking handler counts as a failed attempt.
async fn dispatch_guarded(handler: &dyn FeedHandler, event: &FeedEvent) -> anyhow::Result<()> {
    match AssertUnwindSafe(dispatch(handler, event)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*payload))),
    }
}

pub(crate) fn panic_message<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Offers `event` to `handler`, retrying failures with a fixed delay.
pub async fn deliver_with_retry(
    handler: &Arc<dyn FeedHandler>,
    event: &FeedEvent,
    config: &HandlerRetryConfig,
    scheduler: &Arc<dyn Scheduler>,
) -> DeliveryOutcome {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match dispatch_guarded(handler.as_ref(), event).await {
            Ok(()) => return DeliveryOutcome::Delivered { attempts: attempt },
            Err(e) if attempt < max_attempts => {
                warn!(
                    stream = %event.stream(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "handler failed, retrying event"
                );
                scheduler
                    .sleep(Duration::from_millis(config.retry_delay_ms))
                    .await;
            }
            Err(e) => {
                error!(
                    stream = %event.stream(),
                    conversation = %event.conversation_id(),
                    attempts = attempt,
                    error = %e,
                    "handler failed on every attempt, dropping event"
                );
                return DeliveryOutcome::Dropped { attempts: attempt };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use chrono::Utc;
    use courier_proto::SenderKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<&'static str>>,
    }

    impl Flaky {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn tick(&self, what: &'static str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(what);
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FeedHandler for Flaky {
        async fn on_chat_created(&self, _c: &Conversation) -> anyhow::Result<()> {
            self.tick("chat_created")
        }
        async fn on_chat_deleted(&self, _c: &Conversation) -> anyhow::Result<()> {
            self.tick("chat_deleted")
        }
        async fn on_message_inserted(&self, _m: &Message) -> anyhow::Result<()> {
            self.tick("message_inserted")
        }
    }

    struct Panicky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeedHandler for Panicky {
        async fn on_message_inserted(&self, _m: &Message) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                panic!("handler blew up on attempt {}", n);
            }
            Ok(())
        }
    }

    fn message_event() -> FeedEvent {
        FeedEvent::message(
            Operation::Insert,
            Message {
                id: "m1".into(),
                conversation_id: "c1".into(),
                sender_id: "u".to_string(),
                sender_kind: SenderKind::Counterparty,
                content: "x".to_string(),
                created_at: Utc::now(),
                read: false,
                deleted: false,
            },
        )
    }

    fn conversation_event(op: Operation) -> FeedEvent {
        FeedEvent::conversation(
            op,
            Conversation {
                id: "c1".into(),
                operator_id: "op".to_string(),
                counterparty_id: "cp".to_string(),
                title: None,
                updated_at: Utc::now(),
            },
        )
    }

    fn scheduler() -> Arc<dyn Scheduler> {
        Arc::new(TokioScheduler::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_first_try() {
        let flaky = Flaky::new(0);
        let handler: Arc<dyn FeedHandler> = flaky.clone();
        let outcome = deliver_with_retry(
            &handler,
            &message_event(),
            &HandlerRetryConfig::default(),
            &scheduler(),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget_with_fixed_delay() {
        let flaky = Flaky::new(2);
        let handler: Arc<dyn FeedHandler> = flaky.clone();
        let start = tokio::time::Instant::now();
        let outcome = deliver_with_retry(
            &handler,
            &message_event(),
            &HandlerRetryConfig::default(),
            &scheduler(),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_after_three_failures() {
        let flaky = Flaky::new(u32::MAX);
        let handler: Arc<dyn FeedHandler> = flaky.clone();
        let outcome = deliver_with_retry(
            &handler,
            &message_event(),
            &HandlerRetryConfig::default(),
            &scheduler(),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Dropped { attempts: 3 });
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_by_record_and_operation() {
        let flaky = Flaky::new(0);
        let handler: Arc<dyn FeedHandler> = flaky.clone();
        let cfg = HandlerRetryConfig::default();
        let sched = scheduler();
        deliver_with_retry(&handler, &conversation_event(Operation::Insert), &cfg, &sched).await;
        deliver_with_retry(&handler, &conversation_event(Operation::Delete), &cfg, &sched).await;
        deliver_with_retry(&handler, &message_event(), &cfg, &sched).await;
        // Update has no override here and falls through to the default no-op.
        deliver_with_retry(&handler, &conversation_event(Operation::Update), &cfg, &sched).await;
        assert_eq!(
            *flaky.seen.lock().unwrap(),
            vec!["chat_created", "chat_deleted", "message_inserted"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_counts_as_failed_attempt() {
        let panicky = Arc::new(Panicky {
            calls: AtomicU32::new(0),
        });
        let handler: Arc<dyn FeedHandler> = panicky.clone();
        let outcome = deliver_with_retry(
            &handler,
            &message_event(),
            &HandlerRetryConfig::default(),
            &scheduler(),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
        assert_eq!(panicky.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let fixed: Box<dyn Any + Send> = Box::new("fixed");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*fixed), "fixed");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
