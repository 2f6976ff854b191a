//! # Result Cache
//!
//! Short-TTL, process-local cache for read results that dashboards poll
//! repeatedly. Entries expire a fixed time after insertion; a background
//! sweep drops expired entries that nobody asks for again (one-shot keys
//! from ad hoc ranges would otherwise pile up).
//!
//! There is no single-flight: two concurrent misses on the same key both
//! compute and the later insert wins. Cached values are pure functions of
//! their key, so this only costs redundant work.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// `[cache]` section of the hub config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    2
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Key → value store with a fixed time-to-live.
pub struct ResultCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_secs),
            // tokio intervals reject a zero period
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`. An expired entry is removed on the way out.
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(Instant::now()) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| !entry.is_live(Instant::now()))
        {
            entries.remove(key);
        }
        None
    }

    /// Store `value`, replacing whatever was there.
    pub async fn insert(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Return the cached value, or run `compute` and cache its result.
    ///
    /// Errors from `compute` are returned and never cached.
    pub async fn get_or_compute<E, F, Fut>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key).await {
            tracing::debug!(key, "cache hit");
            return Ok(value);
        }
        tracing::debug!(key, "cache miss");
        let value = compute().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Start the periodic sweep. The task holds a weak reference and stops
    /// once the cache itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cache entries");
                }
            }
        })
    }
}

/// Builds cache keys from every parameter that shapes a result.
///
/// Parts are joined with `|`; `|` and `\` inside a part are escaped, so
/// distinct parameter lists never produce the same key. An absent range
/// bound renders as `\unbounded`, which no escaped part can spell.
/// Bound strings are used exactly as received.
#[derive(Debug, Clone)]
pub struct CacheKey {
    buf: String,
}

impl CacheKey {
    pub const UNBOUNDED: &'static str = "\\unbounded";

    pub fn new(namespace: &str) -> Self {
        Self {
            buf: escape(namespace),
        }
    }

    pub fn part(mut self, value: impl Display) -> Self {
        self.buf.push('|');
        self.buf.push_str(&escape(&value.to_string()));
        self
    }

    pub fn bound(mut self, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.part(v),
            None => {
                self.buf.push('|');
                self.buf.push_str(Self::UNBOUNDED);
                self
            }
        }
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == '|' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> ResultCache<u32> {
        ResultCache::new(CacheConfig::default())
    }

    async fn counted(calls: &AtomicU32) -> Result<u32, String> {
        Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_read_within_ttl_is_a_hit() {
        let cache = cache();
        let calls = AtomicU32::new(0);

        let first = cache.get_or_compute("k", || counted(&calls)).await;
        tokio::time::advance(Duration::from_secs(9)).await;
        let second = cache.get_or_compute("k", || counted(&calls)).await;

        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_ttl_recomputes() {
        let cache = cache();
        let calls = AtomicU32::new(0);

        cache.get_or_compute("k", || counted(&calls)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let again = cache.get_or_compute("k", || counted(&calls)).await;

        assert_eq!(again, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_removed_on_read() {
        let cache = cache();
        cache.insert("k", 7).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_compute_errors_are_not_cached() {
        let cache = cache();
        let failed: Result<u32, String> = cache
            .get_or_compute("k", || async { Err("store down".to_string()) })
            .await;
        assert_eq!(failed, Err("store down".to_string()));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_entries() {
        let cache = cache();
        cache.insert("old", 1).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new", 2).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.get("new").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_evicts_one_shot_keys() {
        let cache = Arc::new(cache());
        let handle = cache.spawn_sweeper();
        cache.insert("one-shot", 1).await;

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(cache.len().await, 0);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_both_compute() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let slow = |cache: Arc<ResultCache<u32>>, calls: Arc<AtomicU32>| async move {
            cache
                .get_or_compute("same", || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst))
                })
                .await
        };
        let (a, b) = tokio::join!(
            slow(cache.clone(), calls.clone()),
            slow(cache.clone(), calls.clone())
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    fn graph_key(bound: Option<&str>) -> String {
        CacheKey::new("graph").part("T1").bound(bound).finish()
    }

    #[test]
    fn test_absent_bound_differs_from_any_present_bound() {
        let open = graph_key(None);
        assert_ne!(open, graph_key(Some("unbounded")));
        assert_ne!(open, graph_key(Some("\\unbounded")));
    }

    #[test]
    fn test_separator_inside_part_is_escaped() {
        let a = CacheKey::new("h").part("a|b").part("c").finish();
        let b = CacheKey::new("h").part("a").part("b|c").finish();
        assert_ne!(a, b);
        assert_eq!(a, "h|a\\|b|c");
    }

    #[test]
    fn test_bounds_are_not_canonicalized() {
        let key = |raw: &str| CacheKey::new("h").bound(Some(raw)).finish();
        let secs = key("2024-01-01T00:00:00Z");
        let millis = key("2024-01-01T00:00:00.000Z");
        assert_ne!(secs, millis);
    }
}
