use crate::event::{EventBus, EventReceiver};
use crate::monitor::{TransferList, TransferListRef, TransferListRegistry};
use crate::timer::ResetTimer;
use crate::transfer::{TransferService, TransferSignal, UPDATE_RECEIVE, UPDATE_SEND};
use courier_api::types::TransferEvent;
use log::warn;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Observes one transfer path: byte counters, a normalized progress fraction
/// and a running flag. Dormant until a non-empty path is set.
pub struct TransferProgress {
    service: Arc<dyn TransferService>,
    registry: TransferListRegistry,
    events: EventBus<TransferEvent>,
    inner: Mutex<ProgressInner>,
}

struct ProgressInner {
    inbound: bool,
    watcher: Option<Watcher>,
}

struct Watcher {
    shared: Arc<WatcherShared>,
    task: tokio::task::JoinHandle<()>,
    // Kept for its drop side effect: releasing it starts the hold window.
    _list_ref: TransferListRef,
}

struct WatcherShared {
    service: Arc<dyn TransferService>,
    path: String,
    events: EventBus<TransferEvent>,
    state: Mutex<WatchState>,
    snapshot: ResetTimer,
}

#[derive(Default)]
struct WatchState {
    inbound: bool,
    valid: bool,
    running: bool,
    progress: f64,
    fetching: bool,
    token: u32,
    bytes_sent: u64,
    bytes_to_send: u64,
    bytes_received: u64,
    bytes_to_receive: u64,
}

impl TransferProgress {
    pub fn new(
        service: Arc<dyn TransferService>,
        registry: TransferListRegistry,
        event_capacity: usize,
    ) -> Self {
        Self {
            service,
            registry,
            events: EventBus::new(event_capacity),
            inner: Mutex::new(ProgressInner {
                inbound: false,
                watcher: None,
            }),
        }
    }

    pub fn subscribe(&self) -> EventReceiver<TransferEvent> {
        self.events.subscribe()
    }

    pub async fn path(&self) -> String {
        let inner = self.inner.lock().await;
        inner
            .watcher
            .as_ref()
            .map(|w| w.shared.path.clone())
            .unwrap_or_default()
    }

    pub async fn inbound(&self) -> bool {
        self.inner.lock().await.inbound
    }

    pub async fn valid(&self) -> bool {
        match &self.inner.lock().await.watcher {
            Some(watcher) => watcher.shared.state.lock().await.valid,
            None => false,
        }
    }

    pub async fn running(&self) -> bool {
        match &self.inner.lock().await.watcher {
            Some(watcher) => watcher.shared.state.lock().await.running,
            None => false,
        }
    }

    pub async fn progress(&self) -> f64 {
        match &self.inner.lock().await.watcher {
            Some(watcher) => watcher.shared.state.lock().await.progress,
            None => 0.0,
        }
    }

    pub async fn set_path(&self, path: &str) {
        let mut inner = self.inner.lock().await;
        let previous = inner
            .watcher
            .as_ref()
            .map(|w| w.shared.path.clone())
            .unwrap_or_default();
        if previous == path {
            return;
        }

        let (was_valid, was_running) = match &inner.watcher {
            Some(watcher) => {
                let state = watcher.shared.state.lock().await;
                (state.valid, state.running)
            }
            None => (false, false),
        };

        // Dropping the watcher disables its update subscription and releases
        // the shared list into its hold window.
        inner.watcher = None;
        if !path.is_empty() {
            inner.watcher = Some(self.spawn_watcher(path, inner.inbound).await);
        }

        self.events.publish(TransferEvent::PathChanged {
            path: path.to_string(),
        });
        // A fresh watcher starts invalid; it reports its own transitions.
        if was_valid {
            self.events
                .publish(TransferEvent::ValidChanged { valid: false });
        }
        if was_running {
            self.events
                .publish(TransferEvent::RunningChanged { running: false });
        }
    }

    pub async fn set_inbound(&self, inbound: bool) {
        let mut inner = self.inner.lock().await;
        if inner.inbound == inbound {
            return;
        }
        inner.inbound = inbound;
        if let Some(watcher) = &inner.watcher {
            let shared = watcher.shared.clone();
            let mut state = shared.state.lock().await;
            state.inbound = inbound;
            if state.valid {
                shared.enable_updates(&mut state);
                shared.update_progress(&mut state);
            }
        }
        self.events
            .publish(TransferEvent::InboundChanged { inbound });
    }

    async fn spawn_watcher(&self, path: &str, inbound: bool) -> Watcher {
        let list_ref = self.registry.acquire().await;
        let shared = Arc::new(WatcherShared {
            service: self.service.clone(),
            path: path.to_string(),
            events: self.events.clone(),
            state: Mutex::new(WatchState {
                inbound,
                ..WatchState::default()
            }),
            snapshot: ResetTimer::new(),
        });
        let list = list_ref.shared();
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            task_shared.run(list).await;
        });
        Watcher {
            shared,
            task,
            _list_ref: list_ref,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.task.abort();
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let token = {
                    let mut state = shared.state.lock().await;
                    std::mem::take(&mut state.token)
                };
                if token != 0 {
                    let _ = shared.service.disable_updates(&shared.path, token).await;
                }
            });
        }
    }
}

impl WatcherShared {
    async fn run(self: Arc<Self>, list: Arc<TransferList>) {
        let mut list_signals = list.subscribe();
        let mut service_signals = self.service.signals();
        self.on_list_changed(&list).await;
        loop {
            tokio::select! {
                signal = list_signals.recv() => match signal {
                    Ok(_) => self.on_list_changed(&list).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                signal = service_signals.recv() => match signal {
                    Ok(TransferSignal::SendProgress { path, sent, total })
                        if path == self.path =>
                    {
                        let mut state = self.state.lock().await;
                        state.bytes_sent = sent;
                        state.bytes_to_send = total;
                        if !state.inbound {
                            self.update_progress(&mut state);
                        }
                    }
                    Ok(TransferSignal::ReceiveProgress { path, received, total })
                        if path == self.path =>
                    {
                        let mut state = self.state.lock().await;
                        state.bytes_received = received;
                        state.bytes_to_receive = total;
                        if state.inbound {
                            self.update_progress(&mut state);
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn on_list_changed(self: &Arc<Self>, list: &Arc<TransferList>) {
        let path_active = list.contains(&self.path).await;
        let mut state = self.state.lock().await;
        if path_active {
            if !state.valid && !state.fetching {
                self.get_all(&mut state);
            }
        } else {
            state.token = 0;
            if state.fetching {
                self.snapshot.cancel();
                state.fetching = false;
            }
            if state.valid {
                state.valid = false;
                self.events
                    .publish(TransferEvent::ValidChanged { valid: false });
                self.update_running(&mut state);
            }
        }
    }

    /// Counter snapshot. Timeout-classified failures are retried; other
    /// errors wait for the next membership change.
    fn get_all(self: &Arc<Self>, state: &mut WatchState) {
        state.fetching = true;
        let ticket = self.snapshot.arm();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let result = this.service.counters(&this.path).await;
                let mut state = this.state.lock().await;
                if !this.snapshot.current(ticket) {
                    return;
                }
                match result {
                    Ok(counters) => {
                        state.fetching = false;
                        state.bytes_sent = counters.bytes_sent;
                        state.bytes_to_send = counters.bytes_to_send;
                        state.bytes_received = counters.bytes_received;
                        state.bytes_to_receive = counters.bytes_to_receive;
                        state.valid = true;
                        this.enable_updates(&mut state);
                        this.update_progress(&mut state);
                        this.events
                            .publish(TransferEvent::ValidChanged { valid: true });
                        return;
                    }
                    Err(err) => {
                        warn!("transfer counters fetch failed: {}", err);
                        if !err.is_timeout() {
                            state.fetching = false;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Swaps the update subscription to the current direction. Timeouts are
    /// retried; the observer works without a token if enablement keeps
    /// failing for other reasons (push updates are then lost until the next
    /// toggle).
    fn enable_updates(self: &Arc<Self>, state: &mut WatchState) {
        if state.token != 0 {
            let token = std::mem::take(&mut state.token);
            let service = self.service.clone();
            let path = self.path.clone();
            tokio::spawn(async move {
                let _ = service.disable_updates(&path, token).await;
            });
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let mask = {
                    let state = this.state.lock().await;
                    if state.inbound {
                        UPDATE_RECEIVE
                    } else {
                        UPDATE_SEND
                    }
                };
                match this.service.enable_updates(&this.path, mask).await {
                    Ok(token) => {
                        this.state.lock().await.token = token;
                        return;
                    }
                    Err(err) => {
                        warn!("enable updates failed for {}: {}", this.path, err);
                        if !err.is_timeout() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn update_progress(&self, state: &mut WatchState) {
        let (transmitted, total) = if state.inbound {
            (state.bytes_received, state.bytes_to_receive)
        } else {
            (state.bytes_sent, state.bytes_to_send)
        };
        let previous = state.progress;
        state.progress = if total > 0 {
            transmitted.min(total) as f64 / total as f64
        } else {
            0.0
        };
        if state.progress != previous {
            self.events.publish(TransferEvent::ProgressChanged {
                progress: state.progress,
            });
        }
        self.update_running(state);
    }

    fn update_running(&self, state: &mut WatchState) {
        let running = state.valid && state.progress > 0.0 && state.progress < 1.0;
        if running != state.running {
            state.running = running;
            self.events
                .publish(TransferEvent::RunningChanged { running });
        }
    }
}
