use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use axum::http::{HeaderMap, header};
use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::server::dtos::stats_dto::CacheStats;

pub type DynResponseCacheService = Arc<dyn ResponseCacheServiceTrait + Send + Sync>;

/// request headers that change what an origin sends back for the same url
const KEY_HEADERS: [header::HeaderName; 2] = [header::ACCEPT, header::ACCEPT_LANGUAGE];

/// A fully processed response body. Never mutated after insert, an overwrite replaces it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub created_at: Instant,
    pub last_access: Instant,
    pub hits: u64,
}

impl CacheEntry {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

pub trait ResponseCacheServiceTrait {
    /// Returns a snapshot of the entry. The body is a refcounted `Bytes`, so an eviction racing
    /// a slice of it can't pull the bytes out from under the reader.
    fn get(&self, key: &str) -> Option<CacheEntry>;
    /// `false` when the body is over the per-entry cap and nothing was stored
    fn set(&self, key: &str, body: Bytes, content_type: Option<String>) -> bool;
    /// returns how many entries were dropped
    fn clear(&self) -> usize;
    fn stats(&self) -> CacheStats;
}

/// Deterministic key for a (url, negotiation headers) pair.
///
/// The url is normalized through `url::Url` first so `HTTPS://CDN.example:443/a` and
/// `https://cdn.example/a` share an entry.
pub fn cache_key(url: &str, headers: &HeaderMap) -> String {
    let normalized = Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string());

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    for name in KEY_HEADERS.iter() {
        // field separators keep "a"+"bc" and "ab"+"c" apart
        hasher.update([0u8]);
        hasher.update(name.as_str().as_bytes());
        hasher.update([b'=']);
        if let Some(value) = headers.get(name) {
            hasher.update(value.as_bytes());
        }
    }

    format!("pcache:{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_bytes: u64,
    hits: u64,
    misses: u64,
}

struct LruState {
    // unbounded by count, the byte budget decides what gets evicted
    entries: LruCache<String, CacheEntry>,
    counters: Counters,
}

impl LruState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.counters.total_bytes -= entry.len() as u64;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.counters.total_bytes -= entry.len() as u64;
        Some(entry)
    }
}

pub struct ResponseCacheService {
    state: Mutex<LruState>,
    max_bytes: u64,
    max_entry_bytes: u64,
}

impl ResponseCacheService {
    pub fn new(max_bytes: u64, max_entry_bytes: u64) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                counters: Counters::default(),
            }),
            max_bytes,
            max_entry_bytes: max_entry_bytes.min(max_bytes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        // every mutation leaves the totals consistent before it can panic, so a poisoned lock is
        // still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseCacheServiceTrait for ResponseCacheService {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut guard = self.lock();
        let state = &mut *guard;

        // get_mut moves the entry to the front of the recency list
        let Some(entry) = state.entries.get_mut(key) else {
            state.counters.misses += 1;
            return None;
        };
        entry.hits += 1;
        entry.last_access = Instant::now();
        let entry = entry.clone();
        state.counters.hits += 1;

        Some(entry)
    }

    fn set(&self, key: &str, body: Bytes, content_type: Option<String>) -> bool {
        let size = body.len() as u64;
        if size > self.max_entry_bytes {
            debug!(
                "not caching {}: {} bytes is over the {} byte entry cap",
                key, size, self.max_entry_bytes
            );
            return false;
        }

        let mut state = self.lock();
        state.remove(key);

        while state.counters.total_bytes + size > self.max_bytes {
            match state.evict_oldest() {
                Some(evicted) => debug!("evicted {} ({} bytes)", evicted.key, evicted.len()),
                None => break,
            }
        }

        let now = Instant::now();
        state.entries.put(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                body,
                content_type,
                created_at: now,
                last_access: now,
                hits: 0,
            },
        );
        state.counters.total_bytes += size;

        true
    }

    fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.counters.total_bytes = 0;
        count
    }

    fn stats(&self) -> CacheStats {
        let state = self.lock();
        let Counters {
            total_bytes,
            hits,
            misses,
        } = state.counters;
        let lookups = hits + misses;

        CacheStats {
            count: state.entries.len(),
            total_bytes,
            max_bytes: self.max_bytes,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bytes(n: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; n])
    }

    #[test]
    fn set_then_get_returns_the_same_bytes() {
        let cache = ResponseCacheService::new(1024, 512);
        let body = Bytes::from_static(b"#EXTM3U\nseg.ts\n");

        assert!(cache.set("k", body.clone(), Some("application/vnd.apple.mpegurl".into())));
        let entry = cache.get("k").unwrap();

        assert_eq!(entry.body, body);
        assert_eq!(entry.hits, 1);
        assert_eq!(entry.content_type.as_deref(), Some("application/vnd.apple.mpegurl"));
    }

    #[test]
    fn evicts_least_recently_used_within_the_bound() {
        let cache = ResponseCacheService::new(100, 100);
        cache.set("a", bytes(40, 1), None);
        cache.set("b", bytes(40, 2), None);
        // touch a so b becomes the oldest
        assert!(cache.get("a").is_some());
        cache.set("c", bytes(40, 3), None);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.stats().total_bytes <= 100);

        for (i, key) in ["d", "e", "f", "g"].iter().enumerate() {
            cache.set(key, bytes(30 + i, 9), None);
            assert!(cache.stats().total_bytes <= 100);
        }
    }

    #[test]
    fn oversized_entries_are_skipped() {
        let cache = ResponseCacheService::new(1000, 10);
        assert!(!cache.set("big", bytes(11, 0), None));
        assert!(cache.get("big").is_none());
        assert_eq!(cache.stats().count, 0);
    }

    #[test]
    fn overwrite_replaces_and_keeps_the_total_right() {
        let cache = ResponseCacheService::new(1000, 1000);
        cache.set("k", bytes(100, 1), None);
        cache.set("k", bytes(10, 2), None);

        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(cache.get("k").unwrap().body, bytes(10, 2));
    }

    #[test]
    fn clear_and_hit_rate() {
        let cache = ResponseCacheService::new(1000, 1000);
        cache.set("k", bytes(5, 1), None);
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().total_bytes, 0);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn a_held_entry_survives_eviction() {
        let cache = ResponseCacheService::new(10, 10);
        cache.set("a", bytes(10, 7), None);
        let held = cache.get("a").unwrap();
        cache.set("b", bytes(10, 8), None);

        assert!(cache.get("a").is_none());
        assert_eq!(&held.body[2..5], &[7, 7, 7]);
    }

    #[test]
    fn keys_follow_url_and_negotiation_headers() {
        let mut headers = HeaderMap::new();
        let plain = cache_key("https://cdn.example/a.m3u8", &headers);

        assert_eq!(plain, cache_key("HTTPS://CDN.example:443/a.m3u8", &headers));
        assert_ne!(plain, cache_key("https://cdn.example/b.m3u8", &headers));
        assert!(plain.starts_with("pcache:"));

        // range and cookies don't take part
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-1"));
        assert_eq!(plain, cache_key("https://cdn.example/a.m3u8", &headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("image/*"));
        assert_ne!(plain, cache_key("https://cdn.example/a.m3u8", &headers));
    }
}
