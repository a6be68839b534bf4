use crate::event::{EventBus, EventReceiver};
use crate::policy::Policy;
use crate::timer::ResetTimer;
use crate::transfer::{TransferService, TransferSignal};
use log::warn;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

#[derive(Clone, Debug)]
pub enum ListSignal {
    ValidChanged,
    Started(String),
    Finished(String),
}

/// Shared client of the remote transfer-listing service. Maintains the set of
/// active transfer paths; one instance serves every progress observer.
pub struct TransferList {
    service: Arc<dyn TransferService>,
    state: Mutex<ListState>,
    fetch: ResetTimer,
    events: EventBus<ListSignal>,
}

struct ListState {
    valid: bool,
    paths: Vec<String>,
    fetching: bool,
}

impl TransferList {
    fn spawn(service: Arc<dyn TransferService>) -> Arc<Self> {
        let list = Arc::new(Self {
            service: service.clone(),
            state: Mutex::new(ListState {
                valid: false,
                paths: Vec::new(),
                fetching: false,
            }),
            fetch: ResetTimer::new(),
            events: EventBus::new(64),
        });

        // Subscribe before probing registration so no event is missed. The
        // watcher holds only a weak handle; the hold-window release must be
        // able to destroy the instance.
        let mut signals = service.signals();
        let weak = Arc::downgrade(&list);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        let Some(list) = weak.upgrade() else { break };
                        list.handle_signal(signal).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let probe = list.clone();
        tokio::spawn(async move {
            if probe.service.is_registered().await {
                probe.request_list();
            }
        });

        list
    }

    pub async fn valid(&self) -> bool {
        self.state.lock().await.valid
    }

    pub async fn contains(&self, path: &str) -> bool {
        let state = self.state.lock().await;
        state.valid && state.paths.iter().any(|p| p == path)
    }

    pub fn subscribe(&self) -> EventReceiver<ListSignal> {
        self.events.subscribe()
    }

    async fn handle_signal(self: &Arc<Self>, signal: TransferSignal) {
        match signal {
            TransferSignal::ServiceRegistered => self.request_list(),
            TransferSignal::ServiceUnregistered => {
                let mut state = self.state.lock().await;
                self.fetch.cancel();
                state.fetching = false;
                state.paths.clear();
                if state.valid {
                    state.valid = false;
                    self.events.publish(ListSignal::ValidChanged);
                }
            }
            TransferSignal::TransferStarted(path) => {
                let mut state = self.state.lock().await;
                if !state.paths.contains(&path) {
                    state.paths.push(path.clone());
                }
                drop(state);
                self.events.publish(ListSignal::Started(path));
            }
            TransferSignal::TransferFinished(path) => {
                let mut state = self.state.lock().await;
                state.paths.retain(|p| p != &path);
                drop(state);
                self.events.publish(ListSignal::Finished(path));
            }
            // Per-transfer progress pushes are consumed by the observers.
            _ => {}
        }
    }

    /// Full membership fetch. Only timeout-classified failures are retried;
    /// anything else leaves the list invalid until the next service event.
    fn request_list(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let ticket = {
                let mut state = this.state.lock().await;
                state.fetching = true;
                this.fetch.arm()
            };
            loop {
                let result = this.service.list_transfers().await;
                let mut state = this.state.lock().await;
                if !this.fetch.current(ticket) {
                    return;
                }
                match result {
                    Ok(paths) => {
                        state.fetching = false;
                        state.paths = paths;
                        state.valid = true;
                        this.events.publish(ListSignal::ValidChanged);
                        return;
                    }
                    Err(err) => {
                        warn!("transfer list fetch failed: {}", err);
                        if !err.is_timeout() {
                            state.fetching = false;
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Promote-or-create registry: one slot holding a non-owning handle. Owning
/// handles are `TransferListRef`s; the last one to drop keeps the instance
/// alive through a hold window so back-to-back transfers reuse it.
#[derive(Clone)]
pub struct TransferListRegistry {
    service: Arc<dyn TransferService>,
    hold_ms: u64,
    slot: Arc<Mutex<Weak<TransferList>>>,
}

impl TransferListRegistry {
    pub fn new(service: Arc<dyn TransferService>, policy: &Policy) -> Self {
        Self {
            service,
            hold_ms: policy.transfer_hold_ms,
            slot: Arc::new(Mutex::new(Weak::new())),
        }
    }

    pub async fn acquire(&self) -> TransferListRef {
        let mut slot = self.slot.lock().await;
        let list = match slot.upgrade() {
            Some(list) => list,
            None => {
                let list = TransferList::spawn(self.service.clone());
                *slot = Arc::downgrade(&list);
                list
            }
        };
        TransferListRef {
            list,
            hold_ms: self.hold_ms,
        }
    }
}

pub struct TransferListRef {
    list: Arc<TransferList>,
    hold_ms: u64,
}

impl TransferListRef {
    pub fn shared(&self) -> Arc<TransferList> {
        self.list.clone()
    }
}

impl std::ops::Deref for TransferListRef {
    type Target = TransferList;

    fn deref(&self) -> &TransferList {
        &self.list
    }
}

impl Drop for TransferListRef {
    fn drop(&mut self) {
        let held = self.list.clone();
        let hold = Duration::from_millis(self.hold_ms);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(hold).await;
                drop(held);
            });
        }
    }
}
