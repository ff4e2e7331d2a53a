//! Test Harness - shared fixtures for multi-instance scenarios

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use courier_cipher::CipherCodec;
use courier_notify::{
    InProcessBus, MarkerStore, MemoryMarkerStore, NotificationCoordinator, NotificationSurface,
    NotifyOnInsert, RenderedNotification,
};
use courier_proto::{
    ApiEnvelope, Conversation, ConversationId, FeedEvent, Message, MessageDraft, MessageGateway,
    MessageId, Operation, SenderKind,
};
use courier_realtime::{
    ChannelSubscriptionManager, FeedHandler, InMemoryFeed, RealtimeConfig, Scheduler,
};
use tempfile::TempDir;

pub const TEST_SECRET: &str = "courier-test-secret";

/// Installs a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

pub fn message(id: &str, conversation: &str, content: &str) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_id: "counterparty-1".to_string(),
        sender_kind: SenderKind::Counterparty,
        content: content.to_string(),
        created_at: Utc::now(),
        read: false,
        deleted: false,
    }
}

pub fn message_event(id: &str, conversation: &str, content: &str) -> FeedEvent {
    FeedEvent::message(Operation::Insert, message(id, conversation, content))
}

pub fn conversation_event(id: &str, operation: Operation) -> FeedEvent {
    FeedEvent::conversation(
        operation,
        Conversation {
            id: id.into(),
            operator_id: "operator-1".to_string(),
            counterparty_id: "counterparty-1".to_string(),
            title: None,
            updated_at: Utc::now(),
        },
    )
}

/// Surface that records everything it is asked to show.
#[derive(Default)]
pub struct RecordingSurface {
    shown: Mutex<Vec<RenderedNotification>>,
}

impl RecordingSurface {
    pub fn shown(&self) -> Vec<RenderedNotification> {
        self.shown.lock().expect("lock poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.shown.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl NotificationSurface for RecordingSurface {
    async fn show(&self, n: &RenderedNotification) -> courier_notify::error::Result<()> {
        self.shown.lock().expect("lock poisoned").push(n.clone());
        Ok(())
    }
}

/// Handler that records what it was given.
#[derive(Default)]
pub struct RecordingHandler {
    pub inserted: Mutex<Vec<MessageId>>,
    pub chats: Mutex<Vec<(Operation, ConversationId)>>,
}

impl RecordingHandler {
    pub fn inserted(&self) -> Vec<MessageId> {
        self.inserted.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl FeedHandler for RecordingHandler {
    async fn on_chat_created(&self, c: &Conversation) -> anyhow::Result<()> {
        self.chats
            .lock()
            .expect("lock poisoned")
            .push((Operation::Insert, c.id.clone()));
        Ok(())
    }

    async fn on_chat_updated(&self, c: &Conversation) -> anyhow::Result<()> {
        self.chats
            .lock()
            .expect("lock poisoned")
            .push((Operation::Update, c.id.clone()));
        Ok(())
    }

    async fn on_chat_deleted(&self, c: &Conversation) -> anyhow::Result<()> {
        self.chats
            .lock()
            .expect("lock poisoned")
            .push((Operation::Delete, c.id.clone()));
        Ok(())
    }

    async fn on_message_inserted(&self, m: &Message) -> anyhow::Result<()> {
        self.inserted.lock().expect("lock poisoned").push(m.id.clone());
        Ok(())
    }
}

/// Data service stand-in: stores rows exactly as sent.
#[derive(Default)]
pub struct InMemoryGateway {
    rows: Mutex<Vec<Message>>,
    next_id: AtomicU64,
}

impl InMemoryGateway {
    /// Rows as stored, without any display processing.
    pub fn stored(&self) -> Vec<Message> {
        self.rows.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl MessageGateway for InMemoryGateway {
    async fn send_message(&self, draft: MessageDraft) -> ApiEnvelope<Message> {
        if draft.content.is_empty() {
            return ApiEnvelope::err("content must not be empty");
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let row = Message {
            id: MessageId::new(format!("msg-{}", n)),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            sender_kind: draft.sender_kind,
            content: draft.content,
            created_at: Utc::now(),
            read: false,
            deleted: false,
        };
        self.rows.lock().expect("lock poisoned").push(row.clone());
        ApiEnvelope::ok(row)
    }

    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiEnvelope<Vec<Message>> {
        let rows = self.rows.lock().expect("lock poisoned");
        ApiEnvelope::ok(
            rows.iter()
                .filter(|m| &m.conversation_id == conversation)
                .cloned()
                .collect(),
        )
    }
}

/// Feed, bus and marker store shared by every simulated client instance.
pub struct SharedWorld {
    pub feed: Arc<InMemoryFeed>,
    pub bus: Arc<InProcessBus>,
    pub store: MemoryMarkerStore,
    pub scheduler: Arc<dyn Scheduler>,
    pub codec: CipherCodec,
}

impl SharedWorld {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            feed: Arc::new(InMemoryFeed::default()),
            bus: Arc::new(InProcessBus::new()),
            store: MemoryMarkerStore::new(),
            scheduler,
            codec: CipherCodec::new(TEST_SECRET),
        }
    }

    /// An instance on the shared bus and store.
    pub fn instance(&self, name: &str) -> Instance {
        let coordinator = NotificationCoordinator::builder(self.codec.clone(), self.scheduler.clone())
            .bus(self.bus.clone())
            .marker_store(Arc::new(self.store.clone()));
        self.finish(name, coordinator)
    }

    /// An instance that can only coordinate through `store`.
    pub fn instance_with_store(&self, name: &str, store: Arc<dyn MarkerStore>) -> Instance {
        let coordinator =
            NotificationCoordinator::builder(self.codec.clone(), self.scheduler.clone())
                .marker_store(store);
        self.finish(name, coordinator)
    }

    fn finish(&self, name: &str, builder: courier_notify::CoordinatorBuilder) -> Instance {
        let surface = Arc::new(RecordingSurface::default());
        let coordinator = builder
            .surface(surface.clone())
            .instance_id(name)
            .build();
        let manager = ChannelSubscriptionManager::new(
            RealtimeConfig::default(),
            self.feed.clone(),
            Arc::new(NotifyOnInsert::new(coordinator.clone())),
            self.scheduler.clone(),
        );
        Instance {
            coordinator,
            surface,
            manager,
        }
    }
}

/// One simulated client instance.
pub struct Instance {
    pub coordinator: NotificationCoordinator,
    pub surface: Arc<RecordingSurface>,
    pub manager: ChannelSubscriptionManager,
}
