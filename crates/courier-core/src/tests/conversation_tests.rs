use super::{collect_until, drain, settle, test_policy, wait_for, wired_channel, REMOTE_UID};
use crate::config::CoreConfig;
use crate::conversation::ConversationChannel;
use crate::directory::InMemoryDirectory;
use crate::messaging::{build_parts, message_text, parse_event_id, MockChannel};
use courier_api::types::{ChannelEvent, ChannelState, InboundMessage};
use std::sync::Arc;

#[tokio::test]
async fn buffered_send_walks_the_full_lifecycle() {
    let (channel, _endpoint, remote) = wired_channel().await;
    let mut rx = channel.subscribe();

    channel.send_message("hello", Some(5)).await;

    let mut states = Vec::new();
    while states.last() != Some(&ChannelState::Ready) {
        let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::StateChanged { .. })).await;
        if let ChannelEvent::StateChanged { state } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ChannelState::PendingRequest,
            ChannelState::Requested,
            ChannelState::PendingReady,
            ChannelState::Ready,
        ]
    );

    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 5 }),
    )
    .await;

    let sent = remote.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(message_text(&sent[0]), Some("hello"));
    assert_eq!(parse_event_id(&sent[0]), Some(5));
}

#[tokio::test]
async fn buffered_messages_flush_in_enqueue_order() {
    let (channel, _endpoint, remote) = wired_channel().await;
    remote.hold_ready().await;

    channel.send_message("one", Some(1)).await;
    channel.send_message("two", Some(2)).await;
    channel.send_message("three", Some(3)).await;
    settle().await;
    assert!(remote.sent().await.is_empty());
    assert!(channel.event_is_pending(2).await);

    let mut rx = channel.subscribe();
    remote.release_ready().await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 3 }),
    )
    .await;

    let texts: Vec<String> = remote
        .sent()
        .await
        .iter()
        .map(|parts| message_text(parts).expect("text part").to_string())
        .collect();
    assert_eq!(texts, ["one", "two", "three"]);
}

#[tokio::test]
async fn acquisition_failure_fails_buffered_messages() {
    let (channel, endpoint, _remote) = wired_channel().await;
    endpoint.fail_requests("Busy", "try later").await;
    let mut rx = channel.subscribe();

    channel.send_message("hi", Some(7)).await;

    let seen = collect_until(&mut rx, |e| matches!(e, ChannelEvent::RequestFailed { .. })).await;
    let failures = seen
        .iter()
        .filter(|e| matches!(e, ChannelEvent::SendingFailed { event_id: 7 }))
        .count();
    assert_eq!(failures, 1);
    assert!(seen.contains(&ChannelEvent::RequestFailed {
        name: "Busy".to_string(),
        message: "try later".to_string(),
    }));

    assert_eq!(channel.state().await, ChannelState::Error);
    assert!(!channel.event_is_pending(7).await);

    settle().await;
    let late = drain(&mut rx);
    assert!(!late
        .iter()
        .any(|e| matches!(e, ChannelEvent::SendingFailed { .. })));
}

#[tokio::test]
async fn resolution_failure_enters_error() {
    let directory = InMemoryDirectory::new();
    let channel = ConversationChannel::new(
        "ring/tel/missing",
        REMOTE_UID,
        Arc::new(directory),
        &CoreConfig::default(),
        test_policy(),
    );
    let mut rx = channel.subscribe();

    channel.send_message("hi", Some(3)).await;

    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingFailed { event_id: 3 }),
    )
    .await;
    assert_eq!(channel.state().await, ChannelState::Error);
    assert!(!channel.event_is_pending(3).await);
}

#[tokio::test]
async fn sequence_tracks_pending_set_changes() {
    let (channel, _endpoint, remote) = wired_channel().await;
    remote.hold_ready().await;
    assert_eq!(channel.sequence().await, 0);

    channel.send_message("one", Some(1)).await;
    assert_eq!(channel.sequence().await, 1);
    channel.send_message("two", Some(2)).await;
    assert_eq!(channel.sequence().await, 2);

    let mut rx = channel.subscribe();
    remote.release_ready().await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 2 }),
    )
    .await;
    // The flush moved both messages into the pending-send set without
    // changing pending-set membership.
    assert_eq!(channel.sequence().await, 2);

    channel.ensure_channel().await;
    assert_eq!(channel.sequence().await, 2);

    channel.send_message("three", Some(3)).await;
    assert_eq!(channel.sequence().await, 3);
}

#[tokio::test]
async fn correlation_id_is_never_in_both_sets() {
    let (channel, _endpoint, remote) = wired_channel().await;
    remote.hold_ready().await;

    channel.send_message("held", Some(11)).await;
    assert_eq!(channel.pending_location(11).await, (true, false));

    let mut rx = channel.subscribe();
    remote.release_ready().await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 11 }),
    )
    .await;
    assert_eq!(channel.pending_location(11).await, (false, true));

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(channel.pending_location(11).await, (false, false));
}

#[tokio::test]
async fn send_without_correlation_id_is_uncorrelated() {
    let (channel, _endpoint, remote) = wired_channel().await;
    let mut rx = channel.subscribe();
    channel.send_message("warm", Some(1)).await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 1 }),
    )
    .await;
    drain(&mut rx);

    channel.send_message("naked", None).await;
    settle().await;

    let seen = drain(&mut rx);
    assert!(seen
        .iter()
        .all(|e| matches!(e, ChannelEvent::SequenceChanged { .. })));
    let sent = remote.sent().await;
    assert_eq!(message_text(&sent[1]), Some("naked"));
}

#[tokio::test]
async fn completion_falls_back_to_parsing_parts() {
    let (channel, _endpoint, _remote) = wired_channel().await;
    let mut rx = channel.subscribe();
    channel.send_message("warm", Some(1)).await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 1 }),
    )
    .await;

    // Dispatch tagged parts without registering the correlation id.
    let parts = build_parts("tagged", Some(42));
    channel.send_parts(parts, None, false).await;

    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 42 }),
    )
    .await;
    // Unregistered entries do not linger in the pending set.
    assert!(!channel.event_is_pending(42).await);
}

#[tokio::test]
async fn invalidation_fails_buffered_and_resets() {
    let (channel, endpoint, remote) = wired_channel().await;
    remote.hold_ready().await;
    let mut rx = channel.subscribe();

    channel.send_message("stuck", Some(1)).await;
    wait_for(&mut rx, |e| {
        matches!(
            e,
            ChannelEvent::StateChanged {
                state: ChannelState::PendingReady
            }
        )
    })
    .await;

    remote.invalidate("connectivity-lost", "link down").await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingFailed { event_id: 1 }),
    )
    .await;
    wait_for(&mut rx, |e| {
        matches!(
            e,
            ChannelEvent::StateChanged {
                state: ChannelState::Null
            }
        )
    })
    .await;

    // A fresh send acquires again through the same endpoint.
    let fresh = MockChannel::new();
    endpoint.set_channel(fresh.clone()).await;
    channel.send_message("again", Some(2)).await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChannelEvent::SendingSucceeded { event_id: 2 }),
    )
    .await;
    assert_eq!(endpoint.request_count().await, 2);
    assert_eq!(fresh.sent().await.len(), 1);
}

#[tokio::test]
async fn inbound_messages_are_acknowledged() {
    let (channel, _endpoint, remote) = wired_channel().await;
    remote
        .queue_inbound(InboundMessage {
            handle: 5,
            parts: Vec::new(),
        })
        .await;

    let mut rx = channel.subscribe();
    channel.ensure_channel().await;
    wait_for(&mut rx, |e| {
        matches!(
            e,
            ChannelEvent::StateChanged {
                state: ChannelState::Ready
            }
        )
    })
    .await;
    settle().await;
    assert!(remote.acked().await.contains(&5));

    remote
        .deliver(InboundMessage {
            handle: 77,
            parts: Vec::new(),
        })
        .await;
    settle().await;
    assert!(remote.acked().await.contains(&77));
}
