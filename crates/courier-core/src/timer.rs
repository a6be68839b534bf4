use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Generation-counted one-shot deadline. Arming again before an earlier wait
/// completes invalidates the earlier ticket, so a burst of restarts coalesces
/// into the single wait armed last. The same counter doubles as a cancellation
/// guard for in-flight fetches.
#[derive(Debug, Default)]
pub struct ResetTimer {
    generation: AtomicU64,
}

impl ResetTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates every outstanding ticket and returns a fresh one.
    pub fn arm(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidates every outstanding ticket.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    /// Sleeps for `delay` and reports whether the ticket survived.
    pub async fn wait(&self, ticket: u64, delay: Duration) -> bool {
        tokio::time::sleep(delay).await;
        self.current(ticket)
    }
}
