//! End-to-end delivery pipeline: feed -> manager -> handler -> coordinator

use std::sync::Arc;
use std::time::Duration;

use courier_cipher::{is_ciphertext_likely, SealedGateway};
use courier_node::TcpFeedTransport;
use courier_notify::NotificationEvent;
use courier_proto::{
    ConversationId, FeedEvent, MessageDraft, MessageGateway, MessageId, Operation, SenderKind,
};
use courier_realtime::{
    ChannelState, ChannelSubscriptionManager, RealtimeConfig, TokioScheduler,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::harness::{
    conversation_event, init_test_tracing, message_event, InMemoryGateway, RecordingHandler,
    SharedWorld,
};

#[tokio::test(start_paused = true)]
async fn test_sealed_message_reaches_surface_as_plaintext() {
    init_test_tracing();
    let world = SharedWorld::new(Arc::new(TokioScheduler::new()));
    let inst = world.instance("desk-1");
    let mut events = inst.coordinator.subscribe_events();
    inst.manager.start().await.unwrap();

    let conv = ConversationId::from("c1");
    let sealed = world.codec.process_for_storage("are you there?", &conv);
    assert!(is_ciphertext_likely(&sealed));
    world.feed.publish(message_event("m1", "c1", &sealed)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let shown = inst.surface.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].body, "are you there?");
    assert!(matches!(events.try_recv(), Ok(NotificationEvent::Shown(_))));
}

#[tokio::test(start_paused = true)]
async fn test_two_open_instances_render_once() {
    init_test_tracing();
    let world = SharedWorld::new(Arc::new(TokioScheduler::new()));
    let a = world.instance("tab-a");
    let b = world.instance("tab-b");
    a.manager.start().await.unwrap();
    b.manager.start().await.unwrap();

    for i in 0..4 {
        world
            .feed
            .publish(message_event(&format!("m{}", i), "c1", "ping"))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(a.surface.count() + b.surface.count(), 4);
    let stats_a = a.coordinator.stats();
    let stats_b = b.coordinator.stats();
    assert_eq!(
        stats_a.deduped + stats_a.deduped_after_claim + stats_b.deduped + stats_b.deduped_after_claim,
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_conversation_events_and_filter() {
    init_test_tracing();
    let world = SharedWorld::new(Arc::new(TokioScheduler::new()));
    let handler = Arc::new(RecordingHandler::default());
    let manager = ChannelSubscriptionManager::new(
        RealtimeConfig::default().for_conversation("c1"),
        world.feed.clone(),
        handler.clone(),
        world.scheduler.clone(),
    );
    manager.start().await.unwrap();

    world.feed.publish(conversation_event("c1", Operation::Insert)).await;
    world.feed.publish(conversation_event("c2", Operation::Delete)).await;
    world.feed.publish(message_event("m1", "c1", "x")).await;
    world.feed.publish(message_event("m2", "c2", "x")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.inserted(), vec![MessageId::from("m1")]);
    assert_eq!(handler.chats.lock().unwrap().len(), 2, "conversation stream is not filtered");
}

#[tokio::test]
async fn test_sealed_gateway_round_trip() {
    let world = SharedWorld::new(Arc::new(TokioScheduler::new()));
    let gateway = SealedGateway::new(InMemoryGateway::default(), world.codec.clone());
    let conv = ConversationId::from("c1");

    for text in ["oi", "a longer reply with spaces", "olá 👋"] {
        let sent = gateway
            .send_message(MessageDraft {
                conversation_id: conv.clone(),
                sender_id: "operator-1".to_string(),
                sender_kind: SenderKind::Operator,
                content: text.to_string(),
            })
            .await
            .into_result()
            .unwrap();
        assert_eq!(sent.content, text);
    }

    for row in gateway.inner().stored() {
        assert!(!row.content.contains(' '), "stored row is not plaintext: {}", row.content);
    }
    let fetched: Vec<String> = gateway
        .fetch_messages(&conv)
        .await
        .into_result()
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(fetched, vec!["oi", "a longer reply with spaces", "olá 👋"]);
}

#[tokio::test]
async fn test_tcp_feed_drives_manager_and_detects_loss() {
    init_test_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Serves both subscriptions, sends one event on the message stream and
    // then hangs up on everyone.
    let server = tokio::spawn(async move {
        let mut conns = Vec::new();
        for _ in 0..2 {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, w) = socket.into_split();
            let mut reader = FramedRead::new(r, LinesCodec::new());
            let writer = FramedWrite::new(w, LinesCodec::new());
            let hello: serde_json::Value =
                serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
            conns.push((hello["stream"].as_str().unwrap().to_string(), writer));
        }
        for (stream, writer) in conns.iter_mut() {
            if stream == "message" {
                let event: FeedEvent = message_event("tcp-1", "c1", "over the wire");
                writer
                    .send(serde_json::to_string(&event).unwrap())
                    .await
                    .unwrap();
            }
        }
        conns
    });

    let handler = Arc::new(RecordingHandler::default());
    let manager = ChannelSubscriptionManager::new(
        RealtimeConfig::default(),
        Arc::new(TcpFeedTransport::new(addr, 16)),
        handler.clone(),
        Arc::new(TokioScheduler::new()),
    );
    manager.start().await.unwrap();
    assert_eq!(manager.state(), ChannelState::Subscribed);

    let conns = server.await.unwrap();
    let mut states = manager.state_changes();
    for _ in 0..100 {
        if !handler.inserted().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.inserted(), vec![MessageId::from("tcp-1")]);

    drop(conns);
    let lost = tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| matches!(s, ChannelState::Reconnecting { .. })),
    )
    .await
    // Release the watch::Ref read guard before stop() publishes a new state.
    .map(|r| r.map(|_| ()));
    assert!(lost.is_ok(), "manager never noticed the dropped connection");
    manager.stop();
}
