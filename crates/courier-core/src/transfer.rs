use crate::error::CoreError;
use async_trait::async_trait;
use courier_api::types::TransferCounters;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

pub const UPDATE_SEND: u32 = 0x01;
pub const UPDATE_RECEIVE: u32 = 0x02;

#[derive(Clone, Debug)]
pub enum TransferSignal {
    ServiceRegistered,
    ServiceUnregistered,
    TransferStarted(String),
    TransferFinished(String),
    SendProgress { path: String, sent: u64, total: u64 },
    ReceiveProgress { path: String, received: u64, total: u64 },
}

/// The remote transfer-listing service and its per-transfer counters.
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn is_registered(&self) -> bool;
    async fn list_transfers(&self) -> Result<Vec<String>, CoreError>;
    async fn counters(&self, path: &str) -> Result<TransferCounters, CoreError>;
    /// Enables push updates for the masked direction; returns a subscription
    /// token for later disablement.
    async fn enable_updates(&self, path: &str, mask: u32) -> Result<u32, CoreError>;
    async fn disable_updates(&self, path: &str, token: u32) -> Result<(), CoreError>;
    fn signals(&self) -> broadcast::Receiver<TransferSignal>;
}

#[derive(Clone)]
pub struct MockTransferService {
    inner: Arc<Mutex<MockTransferState>>,
    signals: broadcast::Sender<TransferSignal>,
}

struct MockTransferState {
    registered: bool,
    transfers: HashMap<String, TransferCounters>,
    list_errors: VecDeque<CoreError>,
    counter_errors: VecDeque<CoreError>,
    enable_errors: VecDeque<CoreError>,
    list_calls: u32,
    next_token: u32,
    enabled: Vec<(String, u32, u32)>,
    disabled: Vec<(String, u32)>,
}

impl MockTransferService {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(MockTransferState {
                registered: false,
                transfers: HashMap::new(),
                list_errors: VecDeque::new(),
                counter_errors: VecDeque::new(),
                enable_errors: VecDeque::new(),
                list_calls: 0,
                next_token: 1,
                enabled: Vec::new(),
                disabled: Vec::new(),
            })),
            signals,
        }
    }

    pub async fn register(&self) {
        self.inner.lock().await.registered = true;
        let _ = self.signals.send(TransferSignal::ServiceRegistered);
    }

    pub async fn unregister(&self) {
        self.inner.lock().await.registered = false;
        let _ = self.signals.send(TransferSignal::ServiceUnregistered);
    }

    pub async fn start_transfer(&self, path: &str, counters: TransferCounters) {
        self.inner
            .lock()
            .await
            .transfers
            .insert(path.to_string(), counters);
        let _ = self
            .signals
            .send(TransferSignal::TransferStarted(path.to_string()));
    }

    pub async fn finish_transfer(&self, path: &str) {
        self.inner.lock().await.transfers.remove(path);
        let _ = self
            .signals
            .send(TransferSignal::TransferFinished(path.to_string()));
    }

    pub async fn push_send_progress(&self, path: &str, sent: u64, total: u64) {
        if let Some(counters) = self.inner.lock().await.transfers.get_mut(path) {
            counters.bytes_sent = sent;
            counters.bytes_to_send = total;
        }
        let _ = self.signals.send(TransferSignal::SendProgress {
            path: path.to_string(),
            sent,
            total,
        });
    }

    pub async fn push_receive_progress(&self, path: &str, received: u64, total: u64) {
        if let Some(counters) = self.inner.lock().await.transfers.get_mut(path) {
            counters.bytes_received = received;
            counters.bytes_to_receive = total;
        }
        let _ = self.signals.send(TransferSignal::ReceiveProgress {
            path: path.to_string(),
            received,
            total,
        });
    }

    pub async fn fail_next_list(&self, err: CoreError) {
        self.inner.lock().await.list_errors.push_back(err);
    }

    pub async fn fail_next_counters(&self, err: CoreError) {
        self.inner.lock().await.counter_errors.push_back(err);
    }

    pub async fn fail_next_enable(&self, err: CoreError) {
        self.inner.lock().await.enable_errors.push_back(err);
    }

    pub async fn list_calls(&self) -> u32 {
        self.inner.lock().await.list_calls
    }

    pub async fn enabled(&self) -> Vec<(String, u32, u32)> {
        self.inner.lock().await.enabled.clone()
    }

    pub async fn disabled(&self) -> Vec<(String, u32)> {
        self.inner.lock().await.disabled.clone()
    }
}

impl Default for MockTransferService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferService for MockTransferService {
    async fn is_registered(&self) -> bool {
        self.inner.lock().await.registered
    }

    async fn list_transfers(&self) -> Result<Vec<String>, CoreError> {
        let mut guard = self.inner.lock().await;
        guard.list_calls += 1;
        if let Some(err) = guard.list_errors.pop_front() {
            return Err(err);
        }
        let mut paths: Vec<String> = guard.transfers.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn counters(&self, path: &str) -> Result<TransferCounters, CoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(err) = guard.counter_errors.pop_front() {
            return Err(err);
        }
        guard
            .transfers
            .get(path)
            .copied()
            .ok_or_else(|| CoreError::Service(path.to_string()))
    }

    async fn enable_updates(&self, path: &str, mask: u32) -> Result<u32, CoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(err) = guard.enable_errors.pop_front() {
            return Err(err);
        }
        let token = guard.next_token;
        guard.next_token += 1;
        guard.enabled.push((path.to_string(), mask, token));
        Ok(token)
    }

    async fn disable_updates(&self, path: &str, token: u32) -> Result<(), CoreError> {
        self.inner
            .lock()
            .await
            .disabled
            .push((path.to_string(), token));
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<TransferSignal> {
        self.signals.subscribe()
    }
}
