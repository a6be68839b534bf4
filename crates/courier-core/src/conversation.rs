use crate::config::CoreConfig;
use crate::directory::AccountDirectory;
use crate::error::CoreError;
use crate::event::{EventBus, EventReceiver};
use crate::messaging::{
    build_parts, parse_event_id, ChannelRequest, ChannelSignal, RemoteChannel, RequestOutcome,
};
use crate::policy::Policy;
use crate::time::now_ms;
use crate::timer::ResetTimer;
use courier_api::types::{ChannelEvent, ChannelState, InboundMessage, MessagePart};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

type SendQueue = mpsc::UnboundedSender<(u64, Vec<MessagePart>)>;

/// Acquisition lifecycle as a single tagged value: owning a ready channel and
/// awaiting a request are mutually exclusive by construction.
enum Link {
    Detached,
    Resolving,
    Requested(Arc<dyn ChannelRequest>),
    Negotiating(Arc<dyn RemoteChannel>),
    Ready {
        channel: Arc<dyn RemoteChannel>,
        sends: SendQueue,
    },
    Failed,
}

impl Link {
    fn state(&self) -> ChannelState {
        match self {
            Link::Detached => ChannelState::Null,
            Link::Resolving => ChannelState::PendingRequest,
            Link::Requested(_) => ChannelState::Requested,
            Link::Negotiating(_) => ChannelState::PendingReady,
            Link::Ready { .. } => ChannelState::Ready,
            Link::Failed => ChannelState::Error,
        }
    }
}

struct Inner {
    link: Link,
    /// Acquisition epoch; tasks spawned for an earlier epoch bail out.
    attempt: u64,
    pending_messages: Vec<(Vec<MessagePart>, Option<i64>)>,
    /// Send operation id to correlation id, for dispatched sends whose
    /// outcome has not been observed yet.
    pending_sends: HashMap<u64, Option<i64>>,
    next_send_id: u64,
    /// Ids whose send succeeded, retained in `pending_sends` until the grace
    /// timer expires.
    sent_events: Vec<i64>,
    sequence: u64,
}

#[derive(Clone)]
pub struct ConversationChannel {
    local_uid: Arc<str>,
    remote_uid: Arc<str>,
    client_name: Arc<str>,
    policy: Policy,
    directory: Arc<dyn AccountDirectory>,
    inner: Arc<Mutex<Inner>>,
    grace: Arc<ResetTimer>,
    events: EventBus<ChannelEvent>,
}

impl ConversationChannel {
    pub fn new(
        local_uid: &str,
        remote_uid: &str,
        directory: Arc<dyn AccountDirectory>,
        config: &CoreConfig,
        policy: Policy,
    ) -> Self {
        Self {
            local_uid: local_uid.into(),
            remote_uid: remote_uid.into(),
            client_name: config.client_name.as_str().into(),
            policy,
            directory,
            inner: Arc::new(Mutex::new(Inner {
                link: Link::Detached,
                attempt: 0,
                pending_messages: Vec::new(),
                pending_sends: HashMap::new(),
                next_send_id: 1,
                sent_events: Vec::new(),
                sequence: 0,
            })),
            grace: Arc::new(ResetTimer::new()),
            events: EventBus::new(config.event_capacity),
        }
    }

    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    pub fn remote_uid(&self) -> &str {
        &self.remote_uid
    }

    pub fn subscribe(&self) -> EventReceiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.link.state()
    }

    pub async fn sequence(&self) -> u64 {
        self.inner.lock().await.sequence
    }

    /// Whether a correlation id is buffered or dispatched-but-unresolved.
    pub async fn event_is_pending(&self, event_id: i64) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pending_messages
            .iter()
            .any(|(_, id)| *id == Some(event_id))
            || inner.pending_sends.values().any(|id| *id == Some(event_id))
    }

    #[cfg(test)]
    pub(crate) async fn pending_location(&self, event_id: i64) -> (bool, bool) {
        let inner = self.inner.lock().await;
        (
            inner
                .pending_messages
                .iter()
                .any(|(_, id)| *id == Some(event_id)),
            inner.pending_sends.values().any(|id| *id == Some(event_id)),
        )
    }

    pub async fn ensure_channel(&self) {
        let mut inner = self.inner.lock().await;
        self.ensure_channel_locked(&mut inner);
    }

    pub async fn send_message(&self, text: &str, event_id: Option<i64>) {
        if event_id.is_none() {
            warn!("no event id in message to {}", self.remote_uid);
        }
        let parts = build_parts(text, event_id);
        self.send_parts(parts, event_id, false).await;
    }

    /// Buffers the message until the channel is ready, dispatching otherwise.
    /// `already_pending` marks a just-flushed buffered item whose pending-set
    /// membership was already counted.
    pub async fn send_parts(
        &self,
        parts: Vec<MessagePart>,
        event_id: Option<i64>,
        already_pending: bool,
    ) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.link, Link::Ready { .. }) {
            self.dispatch(&mut inner, parts, event_id, already_pending);
        } else {
            debug!(
                "buffering message until channel is ready for {}",
                self.remote_uid
            );
            inner.pending_messages.push((parts, event_id));
            if inner.pending_messages.len() == 1 {
                self.ensure_channel_locked(&mut inner);
            }
            self.bump_sequence(&mut inner);
        }
    }

    fn ensure_channel_locked(&self, inner: &mut Inner) {
        match inner.link {
            Link::Detached | Link::Failed => {}
            // A channel is attached or an acquisition is already running.
            _ => return,
        }
        inner.attempt += 1;
        self.set_link(inner, Link::Resolving);
        let this = self.clone();
        let attempt = inner.attempt;
        tokio::spawn(async move {
            this.run_acquisition(attempt).await;
        });
    }

    async fn run_acquisition(self, attempt: u64) {
        let endpoint = match self.directory.resolve(&self.local_uid).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!("no account for {}: {}", self.local_uid, err);
                let mut inner = self.inner.lock().await;
                if inner.attempt == attempt {
                    self.set_link(&mut inner, Link::Failed);
                }
                return;
            }
        };

        let request = match endpoint
            .ensure_conversation(&self.remote_uid, now_ms(), &self.client_name)
            .await
        {
            Ok(request) => request,
            Err(err) => {
                warn!("conversation request failed for {}: {}", self.remote_uid, err);
                let mut inner = self.inner.lock().await;
                if inner.attempt != attempt {
                    return;
                }
                self.set_link(&mut inner, Link::Failed);
                self.events.publish(ChannelEvent::RequestFailed {
                    name: "request".to_string(),
                    message: err.to_string(),
                });
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.attempt != attempt {
                return;
            }
            debug_assert!(matches!(inner.link, Link::Resolving));
            if !matches!(inner.link, Link::Resolving) {
                return;
            }
            debug!("channel request created for {}", self.remote_uid);
            self.set_link(&mut inner, Link::Requested(request.clone()));
        }

        match request.outcome().await {
            RequestOutcome::Failed { name, message } => {
                debug!("channel request failed: {} {}", name, message);
                let mut inner = self.inner.lock().await;
                if inner.attempt != attempt {
                    return;
                }
                debug_assert!(matches!(inner.link, Link::Requested(_)));
                self.set_link(&mut inner, Link::Failed);
                self.events
                    .publish(ChannelEvent::RequestFailed { name, message });
            }
            RequestOutcome::Ready(None) => {
                warn!("channel request succeeded without a channel (dispatcher too old?)");
                let mut inner = self.inner.lock().await;
                if inner.attempt != attempt {
                    return;
                }
                // Failing the link also fails everything buffered.
                self.set_link(&mut inner, Link::Failed);
                debug_assert!(false, "request succeeded without a channel");
            }
            RequestOutcome::Ready(Some(channel)) => {
                {
                    let mut inner = self.inner.lock().await;
                    if inner.attempt != attempt {
                        return;
                    }
                    if !matches!(inner.link, Link::Requested(_)) {
                        return;
                    }
                    self.set_link(&mut inner, Link::Negotiating(channel.clone()));
                }
                self.events.publish(ChannelEvent::RequestSucceeded);
                self.spawn_signal_pump(channel.signals(), attempt);
                match channel.become_ready().await {
                    Ok(()) => self.on_channel_ready(attempt, channel).await,
                    Err(err) => {
                        warn!(
                            "readiness negotiation failed for {}: {}",
                            self.remote_uid, err
                        );
                        self.channel_invalidated(attempt).await;
                    }
                }
            }
        }
    }

    async fn on_channel_ready(&self, attempt: u64, channel: Arc<dyn RemoteChannel>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.attempt != attempt {
                return;
            }
            if !matches!(inner.link, Link::Negotiating(_)) {
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.set_link(
                &mut inner,
                Link::Ready {
                    channel: channel.clone(),
                    sends: tx,
                },
            );
            let this = self.clone();
            let sender_channel = channel.clone();
            tokio::spawn(async move {
                this.run_sender(sender_channel, rx).await;
            });

            let buffered = std::mem::take(&mut inner.pending_messages);
            if !buffered.is_empty() {
                debug!(
                    "sending {} buffered messages to {}",
                    buffered.len(),
                    self.remote_uid
                );
            }
            // Buffered messages were already counted as pending when queued.
            for (parts, event_id) in buffered {
                self.dispatch(&mut inner, parts, event_id, true);
            }
        }

        // Blindly acknowledge everything the remote queued before readiness;
        // the durable store is assumed to have recorded those messages.
        let queued = channel.queued_messages().await;
        if !queued.is_empty() {
            let handles: Vec<u64> = queued.into_iter().map(|m| m.handle).collect();
            tokio::spawn(async move {
                let _ = channel.acknowledge(handles).await;
            });
        }
    }

    fn dispatch(
        &self,
        inner: &mut Inner,
        parts: Vec<MessagePart>,
        event_id: Option<i64>,
        already_pending: bool,
    ) {
        let sends = match &inner.link {
            Link::Ready { sends, .. } => sends.clone(),
            _ => return,
        };
        let send_id = inner.next_send_id;
        inner.next_send_id += 1;
        inner.pending_sends.insert(send_id, event_id);
        let _ = sends.send((send_id, parts));
        if !already_pending {
            self.bump_sequence(inner);
        }
    }

    /// Dispatches queued sends one at a time, preserving enqueue order.
    async fn run_sender(
        &self,
        channel: Arc<dyn RemoteChannel>,
        mut rx: mpsc::UnboundedReceiver<(u64, Vec<MessagePart>)>,
    ) {
        while let Some((send_id, parts)) = rx.recv().await {
            let result = channel.send(parts.clone()).await;
            self.sending_finished(send_id, result, parts).await;
        }
    }

    async fn sending_finished(
        &self,
        send_id: u64,
        result: Result<(), CoreError>,
        parts: Vec<MessagePart>,
    ) {
        let mut inner = self.inner.lock().await;
        let failed = result.is_err();
        let recorded = inner.pending_sends.get(&send_id).copied().flatten();

        if failed {
            // The id is no longer pending; the caller owns retry policy.
            inner.pending_sends.remove(&send_id);
        } else if let Some(id) = recorded {
            // Keep the entry: the delivery status update from the durable
            // store arrives shortly after the send completion, and dropping
            // the entry now would briefly report the message as resolved.
            inner.sent_events.push(id);
            let ticket = self.grace.arm();
            let delay = Duration::from_millis(self.policy.sent_grace_ms);
            let this = self.clone();
            tokio::spawn(async move {
                if this.grace.wait(ticket, delay).await {
                    this.purge_sent().await;
                }
            });
        } else {
            // No correlation id was registered; nothing can resolve this
            // entry later, so it does not stay in the pending set.
            inner.pending_sends.remove(&send_id);
        }

        let event_id = match recorded.or_else(|| parse_event_id(&parts)) {
            Some(id) => id,
            // Untagged completion; nothing to report it against.
            None => return,
        };

        if failed {
            if let Err(err) = &result {
                debug!("send failed for event {}: {}", event_id, err);
            }
            self.events
                .publish(ChannelEvent::SendingFailed { event_id });
            self.bump_sequence(&mut inner);
        } else {
            self.events
                .publish(ChannelEvent::SendingSucceeded { event_id });
        }
    }

    /// Grace expiry: drop every id that accumulated since the last restart.
    /// Deliberately silent; the purge is invisible to observers.
    async fn purge_sent(&self) {
        let mut inner = self.inner.lock().await;
        if inner.sent_events.is_empty() {
            return;
        }
        let sent = std::mem::take(&mut inner.sent_events);
        inner.pending_sends.retain(|_, id| match id {
            Some(id) => !sent.contains(id),
            None => true,
        });
    }

    fn spawn_signal_pump(&self, mut signals: broadcast::Receiver<ChannelSignal>, attempt: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(ChannelSignal::MessageReceived(message)) => {
                        this.message_received(attempt, message).await;
                    }
                    Ok(ChannelSignal::Invalidated { name, message }) => {
                        debug!("channel invalidated: {} {}", name, message);
                        this.channel_invalidated(attempt).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Acknowledgment is fire-and-forget; the durable store owns the record.
    async fn message_received(&self, attempt: u64, message: InboundMessage) {
        let channel = {
            let inner = self.inner.lock().await;
            if inner.attempt != attempt {
                return;
            }
            match &inner.link {
                Link::Negotiating(channel) | Link::Ready { channel, .. } => channel.clone(),
                _ => return,
            }
        };
        let _ = channel.acknowledge(vec![message.handle]).await;
    }

    async fn channel_invalidated(&self, attempt: u64) {
        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt {
            return;
        }
        self.report_pending_failed(&mut inner);
        // Detach whatever is still running for this attempt and permit a
        // fresh acquisition on the next send.
        inner.attempt += 1;
        self.set_link(&mut inner, Link::Detached);
    }

    /// Fails every buffered message, clears the buffer and bumps the
    /// sequence once for the whole batch.
    fn report_pending_failed(&self, inner: &mut Inner) {
        if inner.pending_messages.is_empty() {
            return;
        }
        debug!(
            "failed sending {} buffered messages to {}",
            inner.pending_messages.len(),
            self.remote_uid
        );
        let failed = std::mem::take(&mut inner.pending_messages);
        for (_, event_id) in failed {
            if let Some(event_id) = event_id {
                self.events
                    .publish(ChannelEvent::SendingFailed { event_id });
            }
        }
        self.bump_sequence(inner);
    }

    /// The single transition point; entering `Error` with buffered messages
    /// fails them as a side effect.
    fn set_link(&self, inner: &mut Inner, link: Link) {
        let previous = inner.link.state();
        inner.link = link;
        let state = inner.link.state();
        if state == previous {
            return;
        }
        self.events.publish(ChannelEvent::StateChanged { state });
        if state == ChannelState::Error {
            self.report_pending_failed(inner);
        }
    }

    fn bump_sequence(&self, inner: &mut Inner) {
        inner.sequence += 1;
        self.events.publish(ChannelEvent::SequenceChanged {
            sequence: inner.sequence,
        });
    }
}
