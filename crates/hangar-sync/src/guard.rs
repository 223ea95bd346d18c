use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared "mutation in progress" flag with scoped acquisition.
///
/// The arbiter holds one while applying server data so the field change
/// aggregator ignores the writes it causes; the history manager holds its own
/// while restoring so restores are never captured as new history. Release is
/// tied to the guard's `Drop`, so an early return or a panic cannot leave the
/// flag set.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyFlag {
    depth: Arc<AtomicUsize>,
}

impl ReentrancyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    pub fn acquire(&self) -> ReentrancyGuard {
        self.depth.fetch_add(1, Ordering::SeqCst);
        ReentrancyGuard {
            depth: Arc::clone(&self.depth),
        }
    }
}

#[must_use = "the flag is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReentrancyGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}
