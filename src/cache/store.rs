//! Keyed response cache with TTL, LRU bounding, tags and stale-while-revalidate
//!
//! One entry exists per key. Recency is tracked with a monotonically
//! increasing access tick indexed in a `BTreeMap`, so the least recently
//! used entry is always the first one in the index.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::clock::SharedClock;

/// Cache-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// TTL applied when `set` is not given one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Serve expired entries for a grace period, flagged as stale
    #[serde(default)]
    pub stale_while_revalidate: bool,

    /// Grace period after TTL during which stale entries are served
    #[serde(default = "default_stale_ttl_ms")]
    pub stale_ttl_ms: u64,

    /// Interval of the background prune task
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_max_entries() -> usize {
    1_000
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_stale_ttl_ms() -> u64 {
    60_000
}

fn default_prune_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl_ms: default_ttl_ms(),
            stale_while_revalidate: false,
            stale_ttl_ms: default_stale_ttl_ms(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

/// Per-entry options for [`ResponseCache::set`]
#[derive(Debug, Clone, Default)]
pub struct CacheEntryOptions {
    pub ttl_ms: Option<u64>,
    pub stale_ttl_ms: Option<u64>,
    pub tags: Vec<String>,
    pub etag: Option<String>,
}

impl CacheEntryOptions {
    pub fn ttl(ttl_ms: u64) -> Self {
        Self {
            ttl_ms: Some(ttl_ms),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// A payload returned by [`ResponseCache::get`]
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub data: Value,
    /// TTL has elapsed; the caller should refresh in the background
    pub stale: bool,
    pub etag: Option<String>,
    pub age_ms: u64,
}

/// Entry bookkeeping without the payload
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetadata {
    pub key: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_until_ms: Option<u64>,
    pub ttl_ms: u64,
    pub hits: u64,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub last_accessed_ms: u64,
    pub size_bytes: usize,
    pub stale: bool,
}

/// Cache-wide counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    data: Value,
    created_at_ms: u64,
    ttl_ms: u64,
    stale_ttl_ms: Option<u64>,
    hits: u64,
    tags: HashSet<String>,
    etag: Option<String>,
    last_accessed_ms: u64,
    tick: u64,
}

enum Freshness {
    Fresh,
    Stale,
    Expired,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str, now: u64) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            entry.last_accessed_ms = now;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Response cache for one connector
pub struct ResponseCache {
    name: String,
    config: CacheConfig,
    clock: SharedClock,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(name: impl Into<String>, config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn freshness(&self, entry: &CacheEntry, now: u64) -> Freshness {
        let age = now.saturating_sub(entry.created_at_ms);
        if age < entry.ttl_ms {
            return Freshness::Fresh;
        }
        if self.config.stale_while_revalidate {
            let grace = entry.stale_ttl_ms.unwrap_or(self.config.stale_ttl_ms);
            if age < entry.ttl_ms + grace {
                return Freshness::Stale;
            }
        }
        Freshness::Expired
    }

    /// Store a payload, replacing any entry under the same key
    pub fn set(&self, key: &str, data: Value, options: CacheEntryOptions) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        inner.remove(key);
        let capacity = self.config.max_entries.max(1);
        while inner.entries.len() >= capacity {
            match inner.evict_lru() {
                Some(evicted) => {
                    debug!(cache = %self.name, key = %evicted, "Evicted least recently used entry")
                }
                None => break,
            }
        }

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                created_at_ms: now,
                ttl_ms: options.ttl_ms.unwrap_or(self.config.default_ttl_ms),
                stale_ttl_ms: options.stale_ttl_ms,
                hits: 0,
                tags: options.tags.into_iter().collect(),
                etag: options.etag,
                last_accessed_ms: now,
                tick,
            },
        );
        inner.recency.insert(tick, key.to_string());
    }

    /// Look up a payload
    ///
    /// Returns `None` for missing or hard-expired keys. With
    /// stale-while-revalidate enabled, entries past their TTL but inside the
    /// grace period come back with `stale: true`.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let freshness = match inner.entries.get(key) {
            Some(entry) => self.freshness(entry, now),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if let Freshness::Expired = freshness {
            inner.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.touch(key, now);
        let entry = inner.entries.get_mut(key)?;
        entry.hits += 1;
        Some(CachedValue {
            data: entry.data.clone(),
            stale: matches!(freshness, Freshness::Stale),
            etag: entry.etag.clone(),
            age_ms: now.saturating_sub(entry.created_at_ms),
        })
    }

    /// Whether a servable entry exists; does not touch stats or recency
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|e| !matches!(self.freshness(e, now), Freshness::Expired))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every entry carrying `tag`
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let removed = self.lock().remove_where(|_, e| e.tags.contains(tag));
        debug!(cache = %self.name, tag, removed, "Invalidated entries by tag");
        removed
    }

    /// Remove every entry whose key matches `pattern`
    pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let removed = self.lock().remove_where(|k, _| pattern.is_match(k));
        debug!(cache = %self.name, pattern = %pattern, removed, "Invalidated entries by pattern");
        removed
    }

    /// Eagerly drop hard-expired entries
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let removed =
            inner.remove_where(|_, e| matches!(self.freshness(e, now), Freshness::Expired));
        if removed > 0 {
            debug!(cache = %self.name, removed, "Pruned expired entries");
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Keys of every servable entry, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| !matches!(self.freshness(e, now), Freshness::Expired))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry bookkeeping without the payload
    pub fn get_metadata(&self, key: &str) -> Option<CacheMetadata> {
        let now = self.clock.now_ms();
        let inner = self.lock();
        let entry = inner.entries.get(key)?;
        let freshness = self.freshness(entry, now);
        if let Freshness::Expired = freshness {
            return None;
        }

        let expires_at_ms = entry.created_at_ms + entry.ttl_ms;
        let stale_until_ms = self
            .config
            .stale_while_revalidate
            .then(|| expires_at_ms + entry.stale_ttl_ms.unwrap_or(self.config.stale_ttl_ms));
        let mut tags: Vec<String> = entry.tags.iter().cloned().collect();
        tags.sort();

        Some(CacheMetadata {
            key: key.to_string(),
            created_at_ms: entry.created_at_ms,
            expires_at_ms,
            stale_until_ms,
            ttl_ms: entry.ttl_ms,
            hits: entry.hits,
            tags,
            etag: entry.etag.clone(),
            last_accessed_ms: entry.last_accessed_ms,
            size_bytes: serde_json::to_vec(&entry.data).map(|b| b.len()).unwrap_or(0),
            stale: matches!(freshness, Freshness::Stale),
        })
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            name: self.name.clone(),
            entries: inner.entries.len(),
            max_entries: self.config.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: CacheStats::compute_hit_rate(inner.hits, inner.misses),
        }
    }

    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("name", &self.name)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn cache(config: CacheConfig) -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (ResponseCache::new("test", config, clock.clone()), clock)
    }

    #[test]
    fn test_round_trip() {
        let (cache, _clock) = cache(CacheConfig::default());
        cache.set("GET:/a", json!({"id": 1}), CacheEntryOptions::default());

        let value = cache.get("GET:/a").unwrap();
        assert_eq!(value.data, json!({"id": 1}));
        assert!(!value.stale);
    }

    #[test]
    fn test_ttl_expiry_without_swr() {
        let (cache, clock) = cache(CacheConfig::default());
        cache.set("k", json!(1), CacheEntryOptions::ttl(50));

        clock.advance_ms(49);
        assert!(cache.get("k").is_some());
        clock.advance_ms(1);
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_while_revalidate_window() {
        let (cache, clock) = cache(CacheConfig {
            stale_while_revalidate: true,
            default_ttl_ms: 50,
            stale_ttl_ms: 100,
            ..Default::default()
        });
        cache.set("k", json!("payload"), CacheEntryOptions::default());

        clock.set_ms(75);
        let value = cache.get("k").unwrap();
        assert!(value.stale);
        assert_eq!(value.data, json!("payload"));

        clock.set_ms(160);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_per_entry_stale_ttl_overrides_default() {
        let (cache, clock) = cache(CacheConfig {
            stale_while_revalidate: true,
            default_ttl_ms: 50,
            stale_ttl_ms: 100,
            ..Default::default()
        });
        cache.set(
            "k",
            json!(1),
            CacheEntryOptions {
                stale_ttl_ms: Some(10),
                ..Default::default()
            },
        );
        clock.set_ms(75);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_lru_eviction_uses_access_recency() {
        let (cache, _clock) = cache(CacheConfig {
            max_entries: 3,
            ..Default::default()
        });
        cache.set("a", json!(1), CacheEntryOptions::default());
        cache.set("b", json!(2), CacheEntryOptions::default());
        cache.set("c", json!(3), CacheEntryOptions::default());

        // "a" becomes most recently used, "b" is now the oldest
        assert!(cache.get("a").is_some());
        cache.set("d", json!(4), CacheEntryOptions::default());

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_set_replaces_entry_and_recency() {
        let (cache, _clock) = cache(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.set("a", json!(1), CacheEntryOptions::default());
        cache.set("b", json!(2), CacheEntryOptions::default());
        cache.set("a", json!(10), CacheEntryOptions::default());
        assert_eq!(cache.len(), 2);

        cache.set("c", json!(3), CacheEntryOptions::default());
        assert!(!cache.has("b"));
        assert_eq!(cache.get("a").unwrap().data, json!(10));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_by_tag() {
        let (cache, _clock) = cache(CacheConfig::default());
        cache.set("a", json!(1), CacheEntryOptions::default().with_tags(["case:42"]));
        cache.set(
            "b",
            json!(2),
            CacheEntryOptions::default().with_tags(["case:42", "hospital"]),
        );
        cache.set("c", json!(3), CacheEntryOptions::default().with_tags(["case:7"]));

        assert_eq!(cache.invalidate_by_tag("case:42"), 2);
        assert!(!cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let (cache, _clock) = cache(CacheConfig::default());
        cache.set("GET:/hospitals?zip=1", json!(1), CacheEntryOptions::default());
        cache.set("GET:/hospitals?zip=2", json!(2), CacheEntryOptions::default());
        cache.set("GET:/morgues", json!(3), CacheEntryOptions::default());

        let pattern = Regex::new(r"^GET:/hospitals").unwrap();
        assert_eq!(cache.invalidate_by_pattern(&pattern), 2);
        assert_eq!(cache.keys(), vec!["GET:/morgues".to_string()]);
    }

    #[test]
    fn test_hit_and_miss_accounting() {
        let (cache, _clock) = cache(CacheConfig::default());
        cache.set("a", json!(1), CacheEntryOptions::default());

        cache.get("a");
        cache.get("a");
        cache.get("missing");
        // has() is not counted
        cache.has("a");
        cache.has("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cache.get_metadata("a").unwrap().hits, 2);
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let (cache, clock) = cache(CacheConfig::default());
        cache.set("short", json!(1), CacheEntryOptions::ttl(10));
        cache.set("long", json!(2), CacheEntryOptions::ttl(1_000));

        clock.advance_ms(20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.keys(), vec!["long".to_string()]);
    }

    #[test]
    fn test_metadata_excludes_payload() {
        let (cache, clock) = cache(CacheConfig::default());
        clock.set_ms(1_000);
        cache.set(
            "k",
            json!({"secret": "value"}),
            CacheEntryOptions::ttl(500).with_tags(["x"]).with_etag("v1"),
        );

        let meta = cache.get_metadata("k").unwrap();
        assert_eq!(meta.created_at_ms, 1_000);
        assert_eq!(meta.expires_at_ms, 1_500);
        assert_eq!(meta.etag.as_deref(), Some("v1"));
        assert_eq!(meta.tags, vec!["x".to_string()]);
        assert!(meta.size_bytes > 0);
        let rendered = serde_json::to_string(&meta).unwrap();
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_delete_and_clear() {
        let (cache, _clock) = cache(CacheConfig::default());
        cache.set("a", json!(1), CacheEntryOptions::default());
        cache.set("b", json!(2), CacheEntryOptions::default());

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());
    }
}
