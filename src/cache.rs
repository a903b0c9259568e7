//! LRU content cache (C2): size-bounded admission, LRU eviction, idle-TTL sweep.

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::memory;

/// Default number of cacheable entries (independent of the byte cap).
pub const DEFAULT_CACHE_ENTRIES: usize = 10_000;
/// Default total cache byte budget.
pub const DEFAULT_CACHE_BYTES: usize = 50 * 1024 * 1024;
/// Default per-entry byte cap.
pub const DEFAULT_ENTRY_BYTES: usize = 5 * 1024 * 1024;
/// Default idle-TTL before an entry is swept.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// One cached response, keyed by the normalized absolute request target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub request_key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub size: usize,
    pub inserted_at_secs: u64,
    pub last_accessed_secs: u64,
    pub hit_count: u64,
}

impl CacheEntry {
    fn size_of(key: &str, body: &Bytes) -> usize {
        body.len() + key.len()
    }
}

/// Why an `insert` did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge,
    MemoryPressure,
}

/// Outcome of `lookup`/`insert`, also doubling as the cache's one-way
/// observation stream (spec.md §4.2: "emits observation events").
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { key: String, hit_count: u64 },
    Miss { key: String },
    Added { key: String, size: usize },
    Removed { key: String },
    Expired { key: String },
    Error { key: String, reason: RejectReason },
}

struct Inner {
    map: LruCache<String, CacheEntry>,
}

/// The LRU content cache. Cheap to clone — all state lives behind `Arc`.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Mutex<Inner>>,
    total_bytes: Arc<AtomicUsize>,
    cache_bytes_cap: usize,
    entry_bytes_cap: usize,
    ttl: Duration,
    events: broadcast::Sender<CacheEvent>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Cache {
    pub fn new(entries: usize, cache_bytes_cap: usize, entry_bytes_cap: usize, ttl: Duration) -> Self {
        let total_bytes = Arc::new(AtomicUsize::new(0));
        let (events, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: LruCache::new(NonZeroUsize::new(entries.max(1)).expect("entries must be > 0")),
            })),
            total_bytes,
            cache_bytes_cap,
            entry_bytes_cap,
            ttl,
            events,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_CACHE_ENTRIES,
            DEFAULT_CACHE_BYTES,
            DEFAULT_ENTRY_BYTES,
            DEFAULT_TTL,
        )
    }

    /// Subscribe to cache observation events. Subscribers MUST NOT call back
    /// into the cache synchronously from the receiving task — this is a
    /// fire-and-forget notification stream, not a request/response channel.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        // A broadcast send fails only when there are no receivers; either
        // way we never block or propagate the error to the caller.
        let _ = self.events.send(event);
    }

    /// Looks up `key`, touching LRU order and bumping the hit counter.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        let now = now_secs();

        let expired = match inner.map.peek(key) {
            Some(entry) => now.saturating_sub(entry.last_accessed_secs) > self.ttl.as_secs(),
            None => false,
        };

        if expired {
            if let Some(entry) = inner.map.pop(key) {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                self.emit(CacheEvent::Expired { key: key.to_string() });
            }
            return None;
        }

        if let Some(entry) = inner.map.get_mut(key) {
            entry.last_accessed_secs = now;
            entry.hit_count += 1;
            self.emit(CacheEvent::Hit {
                key: key.to_string(),
                hit_count: entry.hit_count,
            });
            return Some(entry.clone());
        }

        self.emit(CacheEvent::Miss { key: key.to_string() });
        None
    }

    /// Inserts `body` under `key`, evicting least-recently-accessed entries
    /// until the new entry fits. Returns `Ok(())` on success, the rejection
    /// reason otherwise. Size change and map mutation happen in the same
    /// critical section (the cache lock), per spec.md §4.2.
    pub async fn insert(
        &self,
        key: String,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<(), RejectReason> {
        let size = CacheEntry::size_of(&key, &body);
        if size > self.entry_bytes_cap {
            self.emit(CacheEvent::Error {
                key,
                reason: RejectReason::TooLarge,
            });
            return Err(RejectReason::TooLarge);
        }
        if !memory::has_sufficient_memory() {
            self.emit(CacheEvent::Error {
                key,
                reason: RejectReason::MemoryPressure,
            });
            return Err(RejectReason::MemoryPressure);
        }

        let mut inner = self.inner.lock().await;
        let now = now_secs();

        // Pop (not peek) so a pre-existing key is gone from the map before
        // the eviction loop runs below — otherwise, if this key happens to
        // be the LRU victim, pop_lru() would return it again and its size
        // would be subtracted a second time.
        if let Some(old) = inner.map.pop(&key) {
            self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }

        let mut current = self.total_bytes.load(Ordering::Relaxed);
        while current + size > self.cache_bytes_cap {
            match inner.map.pop_lru() {
                Some((evicted_key, evicted)) => {
                    self.total_bytes.fetch_sub(evicted.size, Ordering::Relaxed);
                    current = self.total_bytes.load(Ordering::Relaxed);
                    self.emit(CacheEvent::Removed { key: evicted_key });
                }
                None => break,
            }
        }

        inner.map.put(
            key.clone(),
            CacheEntry {
                request_key: key.clone(),
                body,
                content_type,
                size,
                inserted_at_secs: now,
                last_accessed_secs: now,
                hit_count: 0,
            },
        );
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(key = %key, size, "cache: added");
        self.emit(CacheEvent::Added { key, size });
        Ok(())
    }

    /// Removes every entry whose last-accessed age exceeds the idle TTL.
    /// Collects victims first, then deletes in one pass, per spec.md §4.2.
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let now = now_secs();
        let ttl_secs = self.ttl.as_secs();

        let victims: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_accessed_secs) > ttl_secs)
            .map(|(k, _)| k.clone())
            .collect();

        for key in victims {
            if let Some(entry) = inner.map.pop(&key) {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                self.emit(CacheEvent::Expired { key });
            }
        }
    }

    /// Spawns a background task that calls `sweep()` every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let start = Instant::now();
                cache.sweep().await;
                debug!(elapsed = ?start.elapsed(), "cache: sweep complete");
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.map.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }
}

/// Collapses accidentally repeated scheme prefixes, e.g. `http://http://host`
/// becomes `http://host`, before the key is used for lookup or storage.
pub fn normalize_key(raw: &str) -> String {
    let mut key = raw.to_string();
    loop {
        let collapsed = key.replacen("http://http://", "http://", 1);
        let collapsed = collapsed.replacen("https://https://", "https://", 1);
        if collapsed == key {
            break;
        }
        key = collapsed;
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> Cache {
        Cache::new(100, 1024, 256, Duration::from_secs(3600))
    }

    #[test]
    fn normalize_collapses_repeated_scheme() {
        assert_eq!(
            normalize_key("http://http://example.com/x"),
            "http://example.com/x"
        );
        assert_eq!(normalize_key("http://example.com/x"), "http://example.com/x");
    }

    #[tokio::test]
    async fn insert_then_lookup_roundtrips() {
        let cache = small_cache();
        cache
            .insert("http://a/1".into(), Bytes::from("hello"), None)
            .await
            .unwrap();
        let got = cache.lookup("http://a/1").await.unwrap();
        assert_eq!(got.body, Bytes::from("hello"));
        assert_eq!(got.hit_count, 1);
    }

    #[tokio::test]
    async fn lookup_is_idempotent_and_hit_count_nondecreasing() {
        let cache = small_cache();
        cache
            .insert("k".into(), Bytes::from("v"), None)
            .await
            .unwrap();
        let first = cache.lookup("k").await.unwrap();
        let second = cache.lookup("k").await.unwrap();
        assert_eq!(first.body, second.body);
        assert!(second.hit_count >= first.hit_count);
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected() {
        let cache = small_cache();
        let body = Bytes::from(vec![0u8; 1024]);
        let result = cache.insert("big".into(), body, None).await;
        assert_eq!(result, Err(RejectReason::TooLarge));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn total_never_exceeds_capacity_under_eviction() {
        let cache = small_cache();
        for i in 0..50 {
            let _ = cache
                .insert(format!("key{i}"), Bytes::from(vec![0u8; 100]), None)
                .await;
            assert!(cache.total_size() <= 1024);
        }
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_accessed() {
        let cache = Cache::new(100, 30, 20, Duration::from_secs(3600));
        cache
            .insert("old".into(), Bytes::from(vec![0u8; 10]), None)
            .await
            .unwrap();
        cache
            .insert("mid".into(), Bytes::from(vec![0u8; 10]), None)
            .await
            .unwrap();
        // Touch "old" so "mid" becomes the least-recently-accessed entry.
        let _ = cache.lookup("old").await;
        cache
            .insert("new".into(), Bytes::from(vec![0u8; 10]), None)
            .await
            .unwrap();
        assert!(cache.lookup("mid").await.is_none());
        assert!(cache.lookup("old").await.is_some());
        assert!(cache.lookup("new").await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_idle_entries() {
        let cache = Cache::new(100, 1024, 256, Duration::from_secs(0));
        cache
            .insert("k".into(), Bytes::from("v"), None)
            .await
            .unwrap();
        // TTL of 0 means anything not inserted in this exact second is idle.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.sweep().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn replace_counts_only_the_delta() {
        let cache = small_cache();
        cache
            .insert("k".into(), Bytes::from(vec![0u8; 100]), None)
            .await
            .unwrap();
        let after_first = cache.total_size();
        cache
            .insert("k".into(), Bytes::from(vec![0u8; 50]), None)
            .await
            .unwrap();
        assert!(cache.total_size() < after_first);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn replacing_the_sole_lru_entry_does_not_double_count_its_size() {
        // Total cap is small enough that, after subtracting the old entry's
        // size once, the replacement still doesn't fit unless the eviction
        // loop runs. Since "k" is the only (and therefore least-recently-used)
        // entry, a buggy insert that leaves the old entry in the map would
        // have pop_lru() hand back that same entry and subtract its size a
        // second time, underflowing total_bytes.
        let cache = Cache::new(100, 150, 256, Duration::from_secs(3600));
        cache
            .insert("k".into(), Bytes::from(vec![0u8; 100]), None)
            .await
            .unwrap();
        cache
            .insert("k".into(), Bytes::from(vec![0u8; 200]), None)
            .await
            .unwrap();
        assert_eq!(cache.total_size(), 200 + "k".len());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn events_are_observable() {
        let cache = small_cache();
        let mut rx = cache.subscribe();
        cache
            .insert("k".into(), Bytes::from("v"), None)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        matches!(event, CacheEvent::Added { .. });
    }
}
