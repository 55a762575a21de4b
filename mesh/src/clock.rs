use std::sync::atomic::{AtomicU64, Ordering};

/// Lamport logical clock versioning every replicated directory change.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            counter: AtomicU64::new(value),
        }
    }

    /// Increment and return the new timestamp.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold in a timestamp seen from a peer: `max(local, remote)`.
    pub fn observe(&self, remote: u64) {
        self.counter.fetch_max(remote, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
