//! Reconnect sequences driven by the manual clock

use std::sync::Arc;
use std::time::Duration;

use courier_realtime::{
    ChannelState, ChannelSubscriptionManager, InMemoryFeed, ManualScheduler, RealtimeConfig,
    RealtimeError,
};

use courier_proto::MessageId;

use crate::harness::{init_test_tracing, message_event, RecordingHandler};

struct Rig {
    feed: Arc<InMemoryFeed>,
    clock: Arc<ManualScheduler>,
    handler: Arc<RecordingHandler>,
    manager: ChannelSubscriptionManager,
}

fn rig() -> Rig {
    init_test_tracing();
    let feed = Arc::new(InMemoryFeed::default());
    let clock = Arc::new(ManualScheduler::new());
    let handler = Arc::new(RecordingHandler::default());
    let manager = ChannelSubscriptionManager::new(
        RealtimeConfig::default(),
        feed.clone(),
        handler.clone(),
        clock.clone(),
    );
    Rig {
        feed,
        clock,
        handler,
        manager,
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_always_failing_transport_ends_failed_without_timers() {
    let rig = rig();
    rig.feed.set_unavailable(true);

    assert!(rig.manager.start().await.is_err());
    rig.clock.advance(Duration::from_secs(25)).await;

    assert_eq!(rig.manager.state(), ChannelState::Failed);
    assert_eq!(
        rig.clock.scheduled_delays(),
        vec![1, 2, 4, 8, 10]
            .into_iter()
            .map(Duration::from_secs)
            .collect::<Vec<_>>()
    );
    assert_eq!(rig.clock.pending(), 0);

    let calls = rig.feed.subscribe_calls();
    rig.clock.advance(Duration::from_secs(60)).await;
    assert_eq!(rig.feed.subscribe_calls(), calls, "no retry after FAILED");
}

#[tokio::test]
async fn test_outage_mid_session_recovers_and_keeps_counting() {
    let rig = rig();
    rig.manager.start().await.unwrap();

    rig.feed.publish(message_event("m1", "c1", "x")).await;
    settle().await;

    rig.feed.set_unavailable(true);
    rig.feed.disconnect_all();
    settle().await;
    assert_eq!(rig.manager.state(), ChannelState::Reconnecting { attempt: 1 });

    rig.clock.advance(Duration::from_secs(1)).await;
    rig.clock.advance(Duration::from_secs(2)).await;
    assert_eq!(rig.manager.state(), ChannelState::Reconnecting { attempt: 3 });

    rig.feed.set_unavailable(false);
    rig.clock.advance(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(rig.manager.state(), ChannelState::Subscribed);
    assert_eq!(rig.manager.attempts(), 3);

    rig.feed.publish(message_event("m2", "c1", "x")).await;
    settle().await;
    assert_eq!(rig.handler.inserted(), vec![MessageId::from("m1"), MessageId::from("m2")]);

    // A second outage continues from the spent budget.
    rig.feed.disconnect_all();
    settle().await;
    assert_eq!(rig.manager.state(), ChannelState::Reconnecting { attempt: 4 });
    assert_eq!(rig.clock.next_due_in(), Some(Duration::from_secs(8)));
}

#[tokio::test]
async fn test_manual_reconnect_after_failed() {
    let rig = rig();
    rig.feed.set_unavailable(true);
    let _ = rig.manager.start().await;
    rig.clock.advance(Duration::from_secs(60)).await;
    assert!(matches!(
        rig.manager.start().await,
        Err(RealtimeError::Failed { attempts: 5 })
    ));

    rig.feed.set_unavailable(false);
    rig.manager.reconnect().await.unwrap();
    assert_eq!(rig.manager.state(), ChannelState::Subscribed);
    assert_eq!(rig.manager.attempts(), 0);

    rig.feed.publish(message_event("m1", "c1", "x")).await;
    settle().await;
    assert_eq!(rig.handler.inserted(), vec![MessageId::from("m1")]);
}

#[tokio::test]
async fn test_stop_while_reconnecting_cancels_retry() {
    let rig = rig();
    rig.feed.fail_next_subscribes(1);
    let _ = rig.manager.start().await;
    assert_eq!(rig.clock.pending(), 1);

    rig.manager.stop();
    rig.clock.advance(Duration::from_secs(30)).await;
    assert_eq!(rig.manager.state(), ChannelState::Init);
    assert_eq!(rig.feed.subscribe_calls(), 1);
}
