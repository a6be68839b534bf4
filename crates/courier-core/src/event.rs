use tokio::sync::broadcast;

pub type EventReceiver<T> = broadcast::Receiver<T>;

#[derive(Clone)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver<T> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }
}
