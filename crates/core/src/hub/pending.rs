//! Pending-operation bookkeeping: named buckets of typed waiters plus
//! tracked timers that are guaranteed to die with their owner.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Duration;

/// Bucket holding client request waiters, keyed by request id.
pub(crate) const PENDING_REQUESTS: &str = "inbox:pending_requests";
/// Bucket holding connectivity-probe waiters on the client side.
pub(crate) const PENDING_IS_CONNECT: &str = "inbox:pending_is_connect";
/// Bucket holding receipt-confirmation waiters, keyed by ack id.
pub(crate) const PENDING_ACKS: &str = "endpoint:pending_acks";
/// Bucket holding server-side heartbeat waiters, keyed by request id.
pub(crate) const PENDING_HEARTBEATS: &str = "endpoint:pending_heartbeats";
/// Bucket holding deferred requests waiting for their body stream.
pub(crate) const PENDING_STREAM_STARTS: &str = "streams:pending_starts";

/// Token for cancelling a tracked timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Bucket = HashMap<String, Box<dyn Any + Send>>;

struct PendingInner {
    buckets: Mutex<HashMap<String, Bucket>>,
    timers: Mutex<HashMap<u64, AbortHandle>>,
    next_timer: AtomicU64,
}

/// Named maps of in-flight operations plus the timers that expire them.
///
/// Every timer started here is remembered until it fires or is cleared, and
/// [`clear_all`](Self::clear_all) cancels the lot; teardown can therefore
/// never leak a timer into a destroyed endpoint.
#[derive(Clone)]
pub struct PendingManager {
    inner: Arc<PendingInner>,
}

impl Default for PendingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingManager {
    /// New, empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PendingInner {
                buckets: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    /// Store `value` under `bucket`/`key`, replacing any previous entry.
    pub fn insert<T: Any + Send>(&self, bucket: &str, key: &str, value: T) {
        self.inner
            .buckets
            .lock()
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned(), Box::new(value));
    }

    /// Take the entry out, downcast to `T`. `None` when absent or of a
    /// different type.
    pub fn remove<T: Any + Send>(&self, bucket: &str, key: &str) -> Option<T> {
        let mut buckets = self.inner.buckets.lock();
        let entries = buckets.get_mut(bucket)?;
        let any = entries.remove(key)?;
        match any.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(any) => {
                // Wrong type: put it back rather than silently dropping it.
                entries.insert(key.to_owned(), any);
                None
            }
        }
    }

    /// Whether an entry exists.
    #[must_use]
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.inner
            .buckets
            .lock()
            .get(bucket)
            .is_some_and(|entries| entries.contains_key(key))
    }

    /// Run `f` against the entry in place.
    pub fn with<T: Any + Send, R>(
        &self,
        bucket: &str,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut buckets = self.inner.buckets.lock();
        let entry = buckets.get_mut(bucket)?.get_mut(key)?;
        entry.downcast_mut::<T>().map(f)
    }

    /// Number of entries in a bucket.
    #[must_use]
    pub fn len(&self, bucket: &str) -> usize {
        self.inner
            .buckets
            .lock()
            .get(bucket)
            .map_or(0, HashMap::len)
    }

    /// Whether a bucket has no entries.
    #[must_use]
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    /// Schedule `f` to run once after `delay`. The timer is tracked until it
    /// fires or is cleared.
    pub fn set_timeout(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<PendingInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.timers.lock().remove(&id);
            }
            f();
        });
        self.inner.timers.lock().insert(id, handle.abort_handle());
        TimerId(id)
    }

    /// Cancel a timer before it fires. Harmless when it already fired.
    pub fn clear_timeout(&self, id: TimerId) {
        if let Some(handle) = self.inner.timers.lock().remove(&id.0) {
            handle.abort();
        }
    }

    /// Cancel every tracked timer and drop every bucket entry.
    pub fn clear_all(&self) {
        let handles: Vec<AbortHandle> = {
            let mut timers = self.inner.timers.lock();
            timers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        self.inner.buckets.lock().clear();
    }

    /// Number of live tracked timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.inner.timers.lock().len()
    }
}

impl Debug for PendingManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingManager")
            .field("buckets", &self.inner.buckets.lock().len())
            .field("timers", &self.timer_count())
            .finish()
    }
}

/// Name-keyed saturation counters.
#[derive(Default)]
pub struct Limiter {
    counters: Mutex<HashMap<(String, String), usize>>,
}

impl Limiter {
    /// New limiter with no counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more occupant under `bucket`/`key` unless `limit` is
    /// already reached.
    pub fn try_acquire(&self, bucket: &str, key: &str, limit: usize) -> bool {
        let mut counters = self.counters.lock();
        let count = counters
            .entry((bucket.to_owned(), key.to_owned()))
            .or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Release one occupant.
    pub fn release(&self, bucket: &str, key: &str) {
        let full_key = (bucket.to_owned(), key.to_owned());
        let mut counters = self.counters.lock();
        let drained = match counters.get_mut(&full_key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if drained {
            counters.remove(&full_key);
        }
    }
}

impl Debug for Limiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("counters", &self.counters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn typed_buckets_round_trip() {
        let pending = PendingManager::new();
        pending.insert(PENDING_REQUESTS, "r1", 41u32);
        assert!(pending.contains(PENDING_REQUESTS, "r1"));
        assert_eq!(pending.len(PENDING_REQUESTS), 1);

        pending.with(PENDING_REQUESTS, "r1", |value: &mut u32| *value += 1);
        // Wrong type leaves the entry alone.
        assert_eq!(pending.remove::<String>(PENDING_REQUESTS, "r1"), None);
        assert_eq!(pending.remove::<u32>(PENDING_REQUESTS, "r1"), Some(42));
        assert!(pending.is_empty(PENDING_REQUESTS));
    }

    #[tokio::test]
    async fn cleared_timer_never_fires() {
        let pending = PendingManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = Arc::clone(&fired);
            pending.set_timeout(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        pending.clear_timeout(timer);
        sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(pending.timer_count(), 0);
    }

    #[tokio::test]
    async fn fired_timer_untracks_itself() {
        let pending = PendingManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            pending.set_timeout(Duration::from_millis(5), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(pending.timer_count(), 0);
    }

    #[tokio::test]
    async fn clear_all_cancels_every_timer_and_entry() {
        let pending = PendingManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let fired = Arc::clone(&fired);
            pending.set_timeout(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        pending.insert(PENDING_ACKS, "a1", ());
        pending.clear_all();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(pending.timer_count(), 0);
        assert!(pending.is_empty(PENDING_ACKS));
    }

    #[test]
    fn limiter_saturates_and_releases() {
        let limiter = Limiter::new();
        assert!(limiter.try_acquire("streams", "s1", 2));
        assert!(limiter.try_acquire("streams", "s1", 2));
        assert!(!limiter.try_acquire("streams", "s1", 2));
        limiter.release("streams", "s1");
        assert!(limiter.try_acquire("streams", "s1", 2));
    }
}
