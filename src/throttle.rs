// =============================================================================
// Update Throttle — per-key coalescing of high-frequency updates
// =============================================================================
//
// The first update for an idle key opens a window and schedules exactly one
// delivery at the end of it. Updates that arrive while the window is open only
// replace (or merge into) the pending value. When the window closes the latest
// value is handed to the sink and the key becomes idle again.
//
//   push(k, 1) ─┐
//   push(k, 2)  │ window
//   push(k, 3) ─┘──────────► sink(k, 3)
//
// Guarantees:
//   - at most one delivery per key per window
//   - the last (or merged) value of a window is the one delivered
//   - nothing is scheduled while no updates arrive
//   - cancelled keys are discarded, never delivered late
// =============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Downstream consumer of coalesced updates.
pub type Sink<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Pending<V> {
    value: Option<V>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner<K, V> {
    pending: HashMap<K, Pending<V>>,
    next_generation: u64,
    closed: bool,
}

/// Cooperative, single-consumer coalescer keyed by `K`.
pub struct UpdateThrottle<K, V> {
    name: &'static str,
    window: Duration,
    inner: Arc<Mutex<Inner<K, V>>>,
    sink: Sink<K, V>,
    delivered: Arc<AtomicU64>,
    coalesced: AtomicU64,
}

impl<K, V> UpdateThrottle<K, V>
where
    K: Eq + Hash + Clone + Send + std::fmt::Display + 'static,
    V: Send + 'static,
{
    pub fn new(name: &'static str, window: Duration, sink: Sink<K, V>) -> Self {
        Self {
            name,
            window,
            inner: Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
                next_generation: 0,
                closed: false,
            })),
            sink,
            delivered: Arc::new(AtomicU64::new(0)),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue `value` for `key`; a pending value for the same key is replaced.
    pub fn push(&self, key: K, value: V) -> bool {
        self.push_with(key, value, |_, newer| newer)
    }

    /// Queue `value` for `key`, combining it with a pending value through
    /// `merge(pending, value)`.
    ///
    /// Returns `false` once the throttle has been closed. Outside a tokio
    /// runtime there is no timer to coalesce with, so the value is delivered
    /// immediately.
    pub fn push_with<F>(&self, key: K, value: V, merge: F) -> bool
    where
        F: FnOnce(V, V) -> V,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        if let Some(pending) = inner.pending.get_mut(&key) {
            pending.value = Some(match pending.value.take() {
                Some(old) => merge(old, value),
                None => value,
            });
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                drop(inner);
                warn!(throttle = self.name, key = %key, "no runtime, delivering immediately");
                self.delivered.fetch_add(1, Ordering::Relaxed);
                (self.sink)(key, value);
                return true;
            }
        };

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let timer = handle.spawn(deliver_after(
            self.window,
            key.clone(),
            generation,
            Arc::clone(&self.inner),
            Arc::clone(&self.sink),
            Arc::clone(&self.delivered),
        ));

        inner.pending.insert(
            key,
            Pending {
                value: Some(value),
                generation,
                timer: Some(timer),
            },
        );
        true
    }

    /// Take the pending value for `key` right now, cancelling its timer.
    pub fn flush(&self, key: &K) -> Option<V> {
        let pending = self.inner.lock().pending.remove(key)?;
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        pending.value
    }

    /// Take every pending value, cancelling all timers.
    pub fn flush_all(&self) -> Vec<(K, V)> {
        let drained: Vec<(K, Pending<V>)> = self.inner.lock().pending.drain().collect();
        drained
            .into_iter()
            .filter_map(|(key, pending)| {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                pending.value.map(|v| (key, v))
            })
            .collect()
    }

    /// Discard the pending value for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.lock().pending.remove(key) {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                debug!(throttle = self.name, key = %key, "pending update discarded");
                true
            }
            None => false,
        }
    }

    /// Discard everything pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending<V>> = self.inner.lock().pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        count
    }

    /// Cancel everything and refuse further pushes.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        let discarded = self.cancel_all();
        debug!(throttle = self.name, discarded, "throttle closed");
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of values handed to the sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of pushes folded into an already pending value.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

impl<K, V> Drop for UpdateThrottle<K, V> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, pending) in inner.pending.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}

async fn deliver_after<K, V>(
    window: Duration,
    key: K,
    generation: u64,
    inner: Arc<Mutex<Inner<K, V>>>,
    sink: Sink<K, V>,
    delivered: Arc<AtomicU64>,
) where
    K: Eq + Hash,
{
    tokio::time::sleep(window).await;

    let value = {
        let mut guard = inner.lock();
        let current = guard
            .pending
            .get(&key)
            .map_or(false, |p| p.generation == generation);
        if !current || guard.closed {
            return;
        }
        guard.pending.remove(&key).and_then(|p| p.value)
    };

    if let Some(value) = value {
        delivered.fetch_add(1, Ordering::Relaxed);
        sink(key, value);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(String, u32)>>>;

    fn recording(window_ms: u64) -> (UpdateThrottle<String, u32>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let throttle = UpdateThrottle::new(
            "test",
            Duration::from_millis(window_ms),
            Arc::new(move |k: String, v: u32| sink_log.lock().push((k, v))),
        );
        (throttle, log)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_emits_last_value_once() {
        let (throttle, log) = recording(100);
        for i in 1..=50 {
            throttle.push("BTCUSDT".to_string(), i);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*log.lock(), vec![("BTCUSDT".to_string(), 50)]);
        assert_eq!(throttle.delivered(), 1);
        assert_eq!(throttle.coalesced(), 49);
        assert_eq!(throttle.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_coalesced_independently() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 1);
        throttle.push("B".to_string(), 2);
        throttle.push("A".to_string(), 3);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![("A".to_string(), 3), ("B".to_string(), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn successive_windows_deliver_separately() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        throttle.push("A".to_string(), 2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_throttle_emits_nothing() {
        let (throttle, log) = recording(16);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(log.lock().is_empty());
        assert_eq!(throttle.delivered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_combines_pending_values() {
        let (throttle, log) = recording(100);
        throttle.push_with("A".to_string(), 5, |a, b| a.max(b));
        throttle.push_with("A".to_string(), 9, |a, b| a.max(b));
        throttle.push_with("A".to_string(), 2, |a, b| a.max(b));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*log.lock(), vec![("A".to_string(), 9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_update_is_never_delivered() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 1);
        assert!(throttle.cancel(&"A".to_string()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_takes_pending_value_synchronously() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 7);
        assert_eq!(throttle.flush(&"A".to_string()), Some(7));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(log.lock().is_empty());
        assert_eq!(throttle.flush(&"A".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_throttle_rejects_pushes() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 1);
        throttle.close();
        assert!(!throttle.push("A".to_string(), 2));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(log.lock().is_empty());
    }

    #[test]
    fn without_runtime_delivers_immediately() {
        let (throttle, log) = recording(100);
        throttle.push("A".to_string(), 4);
        assert_eq!(*log.lock(), vec![("A".to_string(), 4)]);
    }
}
