use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Endpoint;

/// A connection that can be parked between requests. Health is checked on
/// both release and acquire so a dead socket is never handed out.
pub trait PoolEntry: Send + 'static {
    fn is_healthy(&self) -> bool;
}

/// Idle connections are cached per origin endpoint within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub group: String,
    pub endpoint: Endpoint,
}

struct IdleEntry<E> {
    entry: E,
    since: Instant,
}

struct PoolInner<E> {
    idle: HashMap<PoolKey, VecDeque<IdleEntry<E>>>,
    total: usize,
}

/// Per-worker cache of idle origin connections. Bounded per key and
/// globally; eviction is FIFO on idle time, so the oldest idle connection
/// goes first.
pub struct ConnectionPool<E: PoolEntry> {
    inner: Mutex<PoolInner<E>>,
    idle_timeout: Duration,
    per_key_limit: usize,
    global_limit: usize,
}

impl<E: PoolEntry> ConnectionPool<E> {
    pub fn new(idle_timeout: Duration, per_key_limit: usize, global_limit: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                total: 0,
            }),
            idle_timeout,
            per_key_limit,
            global_limit,
        }
    }

    /// Take an idle connection for `key`, discarding stale or unhealthy
    /// entries along the way. A returned connection was observed healthy
    /// within the idle window and is handed to exactly this caller.
    pub async fn acquire(&self, key: &PoolKey) -> Option<E> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut found = None;
        if let Some(queue) = inner.idle.get_mut(key) {
            while let Some(idle) = queue.pop_front() {
                inner.total -= 1;
                if idle.since.elapsed() > self.idle_timeout {
                    trace!(group = %key.group, endpoint = %key.endpoint.hostport(), "idle connection expired");
                    continue;
                }
                if !idle.entry.is_healthy() {
                    trace!(group = %key.group, endpoint = %key.endpoint.hostport(), "idle connection unhealthy");
                    continue;
                }
                found = Some(idle.entry);
                break;
            }
        }
        if inner.idle.get(key).map(VecDeque::is_empty).unwrap_or(false) {
            inner.idle.remove(key);
        }
        found
    }

    /// Return a connection to the cache. Unhealthy connections are
    /// destroyed instead; returns whether the entry was kept.
    pub async fn release(&self, key: PoolKey, entry: E) -> bool {
        if !entry.is_healthy() {
            debug!(group = %key.group, endpoint = %key.endpoint.hostport(), "released connection rejected");
            return false;
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let per_key = inner.idle.get(&key).map(VecDeque::len).unwrap_or(0);
        if per_key >= self.per_key_limit {
            if let Some(queue) = inner.idle.get_mut(&key) {
                queue.pop_front();
                inner.total -= 1;
            }
        } else if inner.total >= self.global_limit {
            Self::evict_global_oldest(inner);
        }

        inner.idle.entry(key).or_default().push_back(IdleEntry {
            entry,
            since: Instant::now(),
        });
        inner.total += 1;
        true
    }

    fn evict_global_oldest(inner: &mut PoolInner<E>) {
        let oldest_key = inner
            .idle
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|idle| (key.clone(), idle.since)))
            .min_by_key(|(_, since)| *since)
            .map(|(key, _)| key);
        if let Some(key) = oldest_key {
            if let Some(queue) = inner.idle.get_mut(&key) {
                queue.pop_front();
                inner.total -= 1;
                if queue.is_empty() {
                    inner.idle.remove(&key);
                }
            }
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginProtocol;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestConn {
        id: u32,
        healthy: Arc<AtomicBool>,
    }

    impl PoolEntry for TestConn {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn conn(id: u32) -> (TestConn, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        (
            TestConn {
                id,
                healthy: Arc::clone(&healthy),
            },
            healthy,
        )
    }

    fn key(group: &str, host: &str) -> PoolKey {
        PoolKey {
            group: group.to_string(),
            endpoint: Endpoint {
                host: host.to_string(),
                port: 443,
                tls: true,
                upgrade_scheme: false,
                protocol: OriginProtocol::Http2,
            },
        }
    }

    fn pool() -> ConnectionPool<TestConn> {
        ConnectionPool::new(Duration::from_secs(10), 2, 3)
    }

    #[tokio::test]
    async fn acquire_returns_fifo_order() {
        let pool = pool();
        let k = key("g", "a");
        for id in [1, 2] {
            let (c, _) = conn(id);
            assert!(pool.release(k.clone(), c).await);
        }
        assert_eq!(pool.acquire(&k).await.unwrap().id, 1);
        assert_eq!(pool.acquire(&k).await.unwrap().id, 2);
        assert!(pool.acquire(&k).await.is_none());
    }

    #[tokio::test]
    async fn unhealthy_release_is_destroyed() {
        let pool = pool();
        let k = key("g", "a");
        let (c, healthy) = conn(1);
        healthy.store(false, Ordering::SeqCst);
        assert!(!pool.release(k.clone(), c).await);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn unhealthy_idle_is_skipped_on_acquire() {
        let pool = pool();
        let k = key("g", "a");
        let (c1, h1) = conn(1);
        let (c2, _) = conn(2);
        pool.release(k.clone(), c1).await;
        pool.release(k.clone(), c2).await;
        h1.store(false, Ordering::SeqCst);

        assert_eq!(pool.acquire(&k).await.unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idle_entries_expire() {
        let pool = pool();
        let k = key("g", "a");
        let (c, _) = conn(1);
        pool.release(k.clone(), c).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(pool.acquire(&k).await.is_none());
    }

    #[tokio::test]
    async fn per_key_bound_evicts_oldest() {
        let pool = pool();
        let k = key("g", "a");
        for id in [1, 2, 3] {
            let (c, _) = conn(id);
            pool.release(k.clone(), c).await;
        }
        // Capacity 2: the oldest entry was evicted.
        assert_eq!(pool.idle_count().await, 2);
        assert_eq!(pool.acquire(&k).await.unwrap().id, 2);
        assert_eq!(pool.acquire(&k).await.unwrap().id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn global_bound_evicts_across_keys() {
        let pool = pool();
        for (i, host) in ["a", "b", "c"].iter().enumerate() {
            let (c, _) = conn(i as u32);
            pool.release(key("g", host), c).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        let (c, _) = conn(99);
        pool.release(key("g", "d"), c).await;

        assert_eq!(pool.idle_count().await, 3);
        // The globally oldest entry (key "a") was evicted.
        assert!(pool.acquire(&key("g", "a")).await.is_none());
        assert!(pool.acquire(&key("g", "d")).await.is_some());
    }
}
