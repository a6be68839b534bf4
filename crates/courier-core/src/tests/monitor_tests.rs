use super::{settle, test_policy, wait_for};
use crate::error::CoreError;
use crate::monitor::{ListSignal, TransferListRegistry};
use crate::transfer::MockTransferService;
use courier_api::types::TransferCounters;
use std::sync::Arc;
use std::time::Duration;

fn registry(service: &MockTransferService) -> TransferListRegistry {
    TransferListRegistry::new(Arc::new(service.clone()), &test_policy())
}

fn counters(sent: u64, to_send: u64) -> TransferCounters {
    TransferCounters {
        version: 1,
        bytes_sent: sent,
        bytes_to_send: to_send,
        bytes_received: 0,
        bytes_to_receive: 0,
    }
}

#[tokio::test]
async fn registration_triggers_full_fetch() {
    let service = MockTransferService::new();
    service.start_transfer("/msg/1/Send", counters(0, 10)).await;
    let list = registry(&service).acquire().await;
    let mut rx = list.subscribe();

    assert!(!list.valid().await);
    service.register().await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::ValidChanged)).await;
    assert!(list.valid().await);
    assert!(list.contains("/msg/1/Send").await);
    assert!(!list.contains("/msg/2/Send").await);
}

#[tokio::test]
async fn fetches_when_service_already_registered() {
    let service = MockTransferService::new();
    service.register().await;
    service.start_transfer("/msg/2/Send", counters(0, 10)).await;

    let list = registry(&service).acquire().await;
    for _ in 0..100 {
        if list.valid().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(list.valid().await);
    assert!(list.contains("/msg/2/Send").await);
}

#[tokio::test]
async fn unregistration_clears_membership() {
    let service = MockTransferService::new();
    service.start_transfer("/msg/3/Send", counters(0, 10)).await;
    let list = registry(&service).acquire().await;
    let mut rx = list.subscribe();
    service.register().await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::ValidChanged)).await;

    service.unregister().await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::ValidChanged)).await;
    assert!(!list.valid().await);
    assert!(!list.contains("/msg/3/Send").await);
}

#[tokio::test]
async fn per_item_notifications_update_membership() {
    let service = MockTransferService::new();
    let list = registry(&service).acquire().await;
    let mut rx = list.subscribe();
    service.register().await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::ValidChanged)).await;

    service.start_transfer("/msg/9/Send", counters(0, 10)).await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::Started(_))).await;
    assert!(list.contains("/msg/9/Send").await);

    service.finish_transfer("/msg/9/Send").await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::Finished(_))).await;
    assert!(!list.contains("/msg/9/Send").await);
}

#[tokio::test]
async fn timeout_errors_retry_the_fetch() {
    let service = MockTransferService::new();
    service.fail_next_list(CoreError::Timeout).await;
    service.fail_next_list(CoreError::NoReply).await;
    service.start_transfer("/msg/4/Send", counters(0, 10)).await;

    let list = registry(&service).acquire().await;
    let mut rx = list.subscribe();
    service.register().await;
    wait_for(&mut rx, |e| matches!(e, ListSignal::ValidChanged)).await;
    assert!(list.valid().await);
    assert!(service.list_calls().await >= 3);
}

#[tokio::test]
async fn other_errors_are_not_retried() {
    let service = MockTransferService::new();
    service
        .fail_next_list(CoreError::Service("denied".to_string()))
        .await;
    service.register().await;

    let list = registry(&service).acquire().await;
    settle().await;
    settle().await;
    assert!(!list.valid().await);
    assert_eq!(service.list_calls().await, 1);
}

#[tokio::test]
async fn observers_share_one_instance() {
    let service = MockTransferService::new();
    let registry = registry(&service);
    let first = registry.acquire().await;
    let second = registry.acquire().await;
    assert!(Arc::ptr_eq(&first.shared(), &second.shared()));
}

#[tokio::test]
async fn release_holds_the_instance_through_the_grace_window() {
    let service = MockTransferService::new();
    let registry = registry(&service);

    let first = registry.acquire().await;
    let weak = Arc::downgrade(&first.shared());
    drop(first);

    // Hold window is 120ms in the test policy; reacquire well inside it.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = registry.acquire().await;
    let promoted = weak.upgrade().expect("instance retained through hold window");
    assert!(Arc::ptr_eq(&promoted, &second.shared()));
    drop(promoted);
    drop(second);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(weak.upgrade().is_none());
}
