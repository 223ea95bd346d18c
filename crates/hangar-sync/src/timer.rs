/// Timer primitives with deterministic cancellation
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A recurring task. The first tick fires one `period` after start; dropping
/// or stopping the handle cancels it immediately.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Independent trailing-edge debounce timers keyed by `K`.
///
/// Scheduling a key replaces only that key's pending timer. Once a timer
/// fires, its action runs on its own task and is no longer cancellable.
#[derive(Debug)]
pub struct KeyedDebouncer<K> {
    pending: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Default for KeyedDebouncer<K> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedDebouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<Fut>(&self, key: K, delay: Duration, action: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action);
        });
        if let Some(previous) = self.pending.lock().insert(key, timer) {
            previous.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in self.pending.lock().drain() {
            timer.abort();
        }
    }

    /// Timers that have not fired yet.
    pub fn pending(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|_, timer| !timer.is_finished());
        pending.len()
    }
}

impl<K> Drop for KeyedDebouncer<K> {
    fn drop(&mut self) {
        for (_, timer) in self.pending.get_mut().drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_stops_on_drop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = PeriodicTask::start(Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        drop(task);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keys_are_independent() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let debouncer = KeyedDebouncer::new();

        for value in ["D", "D-A", "D-AB"] {
            let fired = Arc::clone(&fired);
            debouncer.schedule("aircraft-1", Duration::from_millis(500), async move {
                fired.lock().push(("aircraft-1", value));
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let sink = Arc::clone(&fired);
        debouncer.schedule("notes-1", Duration::from_millis(150), async move {
            sink.lock().push(("notes-1", "done"));
        });

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(
            *fired.lock(),
            vec![("notes-1", "done"), ("aircraft-1", "D-AB")]
        );
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let debouncer = KeyedDebouncer::new();
        for key in 0..3 {
            let fired = Arc::clone(&fired);
            debouncer.schedule(key, Duration::from_millis(100), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(debouncer.pending(), 3);

        debouncer.cancel_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
