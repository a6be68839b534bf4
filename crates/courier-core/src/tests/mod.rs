pub mod conversation_tests;
pub mod monitor_tests;

use crate::config::CoreConfig;
use crate::conversation::ConversationChannel;
use crate::directory::InMemoryDirectory;
use crate::event::EventReceiver;
use crate::messaging::{MockChannel, MockEndpoint};
use crate::monitor::TransferListRegistry;
use crate::policy::Policy;
use crate::progress::TransferProgress;
use crate::transfer::MockTransferService;
use std::sync::Arc;
use std::time::Duration;

pub const LOCAL_UID: &str = "ring/tel/account0";
pub const REMOTE_UID: &str = "+15551234567";

pub fn test_policy() -> Policy {
    Policy {
        sent_grace_ms: 60,
        transfer_hold_ms: 120,
    }
}

pub async fn wired_channel() -> (ConversationChannel, MockEndpoint, Arc<MockChannel>) {
    wired_channel_with(test_policy()).await
}

pub async fn wired_channel_with(
    policy: Policy,
) -> (ConversationChannel, MockEndpoint, Arc<MockChannel>) {
    let directory = InMemoryDirectory::new();
    let endpoint = MockEndpoint::new();
    directory
        .register(LOCAL_UID, Arc::new(endpoint.clone()))
        .await;
    let channel = ConversationChannel::new(
        LOCAL_UID,
        REMOTE_UID,
        Arc::new(directory),
        &CoreConfig::default(),
        policy,
    );
    let remote = endpoint.channel().await;
    (channel, endpoint, remote)
}

pub fn wired_progress(service: &MockTransferService) -> TransferProgress {
    let registry = TransferListRegistry::new(Arc::new(service.clone()), &test_policy());
    TransferProgress::new(Arc::new(service.clone()), registry, 64)
}

pub async fn wait_for<T, F>(rx: &mut EventReceiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Collects events up to and including the first one matching `done`.
pub async fn collect_until<T, F>(rx: &mut EventReceiver<T>, mut done: F) -> Vec<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

pub fn drain<T: Clone>(rx: &mut EventReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Gives spawned reactions a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
