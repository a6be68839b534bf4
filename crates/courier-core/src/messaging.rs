use crate::error::CoreError;
use async_trait::async_trait;
use courier_api::types::{InboundMessage, MessagePart, EVENT_ID_KEY};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

#[derive(Clone, Debug)]
pub enum ChannelSignal {
    MessageReceived(InboundMessage),
    Invalidated { name: String, message: String },
}

pub enum RequestOutcome {
    /// `None` models a dispatcher that reports success without handing back a
    /// channel object.
    Ready(Option<Arc<dyn RemoteChannel>>),
    Failed { name: String, message: String },
}

/// A conversation-capable endpoint obtained from the account directory.
#[async_trait]
pub trait ConversationEndpoint: Send + Sync {
    async fn ensure_conversation(
        &self,
        remote_uid: &str,
        timestamp_ms: u64,
        client_name: &str,
    ) -> Result<Arc<dyn ChannelRequest>, CoreError>;
}

/// An in-flight channel acquisition. Resolves exactly once.
#[async_trait]
pub trait ChannelRequest: Send + Sync {
    async fn outcome(&self) -> RequestOutcome;
}

#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Feature negotiation; the channel accepts sends only after this
    /// completes.
    async fn become_ready(&self) -> Result<(), CoreError>;
    async fn send(&self, parts: Vec<MessagePart>) -> Result<(), CoreError>;
    /// Messages the remote queued before readiness was reached.
    async fn queued_messages(&self) -> Vec<InboundMessage>;
    async fn acknowledge(&self, handles: Vec<u64>) -> Result<(), CoreError>;
    fn signals(&self) -> broadcast::Receiver<ChannelSignal>;
}

pub fn build_parts(text: &str, event_id: Option<i64>) -> Vec<MessagePart> {
    let mut header = MessagePart::new();
    if let Some(id) = event_id {
        header.fields.insert(EVENT_ID_KEY.to_string(), json!(id));
    }
    let body = MessagePart::new()
        .with("content-type", json!("text/plain"))
        .with("content", json!(text));
    vec![header, body]
}

pub fn parse_event_id(parts: &[MessagePart]) -> Option<i64> {
    parts.first().and_then(|part| part.get_i64(EVENT_ID_KEY))
}

pub fn message_text(parts: &[MessagePart]) -> Option<&str> {
    parts.iter().find_map(|part| part.get_str("content"))
}

#[derive(Clone)]
pub struct MockEndpoint {
    inner: Arc<Mutex<EndpointScript>>,
}

struct EndpointScript {
    fail_with: Option<(String, String)>,
    channel: Arc<MockChannel>,
    requests: u32,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EndpointScript {
                fail_with: None,
                channel: MockChannel::new(),
                requests: 0,
            })),
        }
    }

    pub async fn channel(&self) -> Arc<MockChannel> {
        self.inner.lock().await.channel.clone()
    }

    /// Replaces the channel handed out by subsequent requests.
    pub async fn set_channel(&self, channel: Arc<MockChannel>) {
        self.inner.lock().await.channel = channel;
    }

    pub async fn fail_requests(&self, name: &str, message: &str) {
        self.inner.lock().await.fail_with = Some((name.to_string(), message.to_string()));
    }

    pub async fn request_count(&self) -> u32 {
        self.inner.lock().await.requests
    }
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationEndpoint for MockEndpoint {
    async fn ensure_conversation(
        &self,
        _remote_uid: &str,
        _timestamp_ms: u64,
        _client_name: &str,
    ) -> Result<Arc<dyn ChannelRequest>, CoreError> {
        let mut guard = self.inner.lock().await;
        guard.requests += 1;
        Ok(Arc::new(MockRequest {
            fail_with: guard.fail_with.clone(),
            channel: guard.channel.clone(),
        }))
    }
}

struct MockRequest {
    fail_with: Option<(String, String)>,
    channel: Arc<MockChannel>,
}

#[async_trait]
impl ChannelRequest for MockRequest {
    async fn outcome(&self) -> RequestOutcome {
        match &self.fail_with {
            Some((name, message)) => RequestOutcome::Failed {
                name: name.clone(),
                message: message.clone(),
            },
            None => RequestOutcome::Ready(Some(self.channel.clone() as Arc<dyn RemoteChannel>)),
        }
    }
}

pub struct MockChannel {
    state: Mutex<MockChannelState>,
    ready_gate: Notify,
    signals: broadcast::Sender<ChannelSignal>,
}

struct MockChannelState {
    hold_ready: bool,
    closed: bool,
    queued: Vec<InboundMessage>,
    sent: Vec<Vec<MessagePart>>,
    send_results: VecDeque<Result<(), CoreError>>,
    acked: Vec<u64>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(MockChannelState {
                hold_ready: false,
                closed: false,
                queued: Vec::new(),
                sent: Vec::new(),
                send_results: VecDeque::new(),
                acked: Vec::new(),
            }),
            ready_gate: Notify::new(),
            signals,
        })
    }

    /// Parks `become_ready` callers until `release_ready`.
    pub async fn hold_ready(&self) {
        self.state.lock().await.hold_ready = true;
    }

    pub async fn release_ready(&self) {
        self.state.lock().await.hold_ready = false;
        self.ready_gate.notify_waiters();
    }

    /// Queues a message as if it arrived before readiness.
    pub async fn queue_inbound(&self, message: InboundMessage) {
        self.state.lock().await.queued.push(message);
    }

    pub async fn deliver(&self, message: InboundMessage) {
        let _ = self.signals.send(ChannelSignal::MessageReceived(message));
    }

    pub async fn invalidate(&self, name: &str, message: &str) {
        self.state.lock().await.closed = true;
        self.ready_gate.notify_waiters();
        let _ = self.signals.send(ChannelSignal::Invalidated {
            name: name.to_string(),
            message: message.to_string(),
        });
    }

    /// Scripts the outcome of the next unscripted send (defaults to success).
    pub async fn script_send(&self, result: Result<(), CoreError>) {
        self.state.lock().await.send_results.push_back(result);
    }

    pub async fn sent(&self) -> Vec<Vec<MessagePart>> {
        self.state.lock().await.sent.clone()
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.state.lock().await.acked.clone()
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn become_ready(&self) -> Result<(), CoreError> {
        loop {
            let notified = self.ready_gate.notified();
            {
                let guard = self.state.lock().await;
                if guard.closed {
                    return Err(CoreError::Closed);
                }
                if !guard.hold_ready {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn send(&self, parts: Vec<MessagePart>) -> Result<(), CoreError> {
        let mut guard = self.state.lock().await;
        if guard.closed {
            return Err(CoreError::Closed);
        }
        let result = guard.send_results.pop_front().unwrap_or(Ok(()));
        guard.sent.push(parts);
        result
    }

    async fn queued_messages(&self) -> Vec<InboundMessage> {
        self.state.lock().await.queued.clone()
    }

    async fn acknowledge(&self, handles: Vec<u64>) -> Result<(), CoreError> {
        let mut guard = self.state.lock().await;
        guard.queued.retain(|m| !handles.contains(&m.handle));
        guard.acked.extend(handles);
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }
}
