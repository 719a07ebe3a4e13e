//! Two-tier result cache for aggregate queries.
//!
//! The short tier holds cheap, fast-changing aggregates; the long tier holds
//! expensive, slow-changing ones. The caller decides which tier a query
//! belongs to. Each tier is an LRU with a fixed TTL, and expiry is checked
//! lazily when an entry is read.
//!
//! Entries may be served stale until their TTL elapses or they are
//! invalidated: writes to the underlying stores do not reach the cache on
//! their own. Two concurrent misses for the same key both run the query;
//! there is no single-flight de-duplication.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSettings;
use crate::metrics::{CACHE_EVICTIONS, CACHE_HITS, CACHE_MISSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Short,
    Long,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Short, Tier::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Short => "short",
            Tier::Long => "long",
        }
    }

    fn other(&self) -> Tier {
        match self {
            Tier::Short => Tier::Long,
            Tier::Long => Tier::Short,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic cache key built from a query identity and its parameters,
/// rendered as `query:param1:param2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: String,
    query_len: usize,
}

impl Fingerprint {
    pub fn new<I, P>(query: &str, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: fmt::Display,
    {
        let mut key = escape(query);
        let query_len = key.len();
        for param in params {
            key.push(':');
            key.push_str(&escape(&param.to_string()));
        }
        Self { key, query_len }
    }

    /// The query identity part, which is also the key's class.
    pub fn query_id(&self) -> &str {
        &self.key[..self.query_len]
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn escape(part: &str) -> String {
    part.replace('\\', "\\\\").replace(':', "\\:")
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: Fingerprint,
    pub value: V,
    pub tier: Tier,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Read-only projection of one tier's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheTierStats {
    pub tier: Tier,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Hit(V),
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            CacheLookup::Hit(v) => Some(v),
            CacheLookup::Miss => None,
        }
    }
}

struct TierCache<V> {
    tier: Tier,
    ttl: Duration,
    entries: Mutex<LruCache<Fingerprint, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TierCache<V> {
    fn new(tier: Tier, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tier,
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up without touching the hit/miss counters. Expired entries are
    /// removed on the way.
    fn lookup(&self, key: &Fingerprint, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }
        entries.pop(key);
        CACHE_EVICTIONS
            .with_label_values(&[self.tier.as_str(), "expired"])
            .inc();
        debug!(tier = self.tier.as_str(), key = %key, "Cache entry expired");
        None
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS.with_label_values(&[self.tier.as_str()]).inc();
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES.with_label_values(&[self.tier.as_str()]).inc();
    }

    fn insert(&self, key: Fingerprint, value: V, now: Instant) {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            tier: self.tier,
            inserted_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
        };
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                CACHE_EVICTIONS
                    .with_label_values(&[self.tier.as_str(), "capacity"])
                    .inc();
                debug!(tier = self.tier.as_str(), key = %evicted, "Evicted least recently used entry");
            }
        }
    }

    fn remove(&self, key: &Fingerprint) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    fn stats(&self) -> CacheTierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheTierStats {
            tier: self.tier,
            entries: self.entries.lock().len(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Registry of the two tiers plus the tier each query class is expected in.
pub struct CacheTierManager<V> {
    tiers: HashMap<Tier, TierCache<V>>,
    /// query id -> tier its misses are counted against. Held for writing
    /// across a whole `put` so a key can never land in both tiers.
    classes: RwLock<HashMap<String, Tier>>,
}

impl<V: Clone> CacheTierManager<V> {
    pub fn new(short_ttl: Duration, short_capacity: usize, long_ttl: Duration, long_capacity: usize) -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Short, TierCache::new(Tier::Short, short_ttl, short_capacity));
        tiers.insert(Tier::Long, TierCache::new(Tier::Long, long_ttl, long_capacity));
        Self {
            tiers,
            classes: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        let short = settings.tier(Tier::Short);
        let long = settings.tier(Tier::Long);
        Self::new(short.ttl, short.capacity, long.ttl, long.capacity)
    }

    fn tier(&self, tier: Tier) -> &TierCache<V> {
        // both tiers are inserted in `new`
        &self.tiers[&tier]
    }

    pub fn ttl(&self, tier: Tier) -> Duration {
        self.tier(tier).ttl
    }

    /// Declare which tier a query class belongs to, so its misses are
    /// counted against that tier even before anything is cached for it.
    pub fn assign(&self, query_id: &str, tier: Tier) {
        self.classes.write().insert(query_id.to_string(), tier);
    }

    /// The tier currently holding `key`, or else the tier its class was
    /// last assigned to.
    pub fn owner(&self, key: &Fingerprint) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| self.tier(*t).entries.lock().contains(key))
            .or_else(|| self.classes.read().get(key.query_id()).copied())
    }

    /// Look the key up, short tier first. A key is held by at most one tier,
    /// so the hit is counted where it was found. A miss counts against the
    /// tier of the key's class, or the short tier for an unknown class.
    pub fn get(&self, key: &Fingerprint) -> CacheLookup<V> {
        let now = Instant::now();
        for tier in Tier::ALL {
            let cache = self.tier(tier);
            if let Some(value) = cache.lookup(key, now) {
                cache.record_hit();
                debug!(tier = tier.as_str(), key = %key, "Cache hit");
                return CacheLookup::Hit(value);
            }
        }

        let tier = self
            .classes
            .read()
            .get(key.query_id())
            .copied()
            .unwrap_or(Tier::Short);
        self.tier(tier).record_miss();
        debug!(tier = tier.as_str(), key = %key, "Cache miss");
        CacheLookup::Miss
    }

    /// Insert with the tier's TTL, evicting the least recently used entry if
    /// the tier is full. The key is dropped from the other tier first; other
    /// keys of the same class stay where they are.
    pub fn put(&self, key: Fingerprint, value: V, tier: Tier) {
        let mut classes = self.classes.write();
        if classes.get(key.query_id()) != Some(&tier) {
            classes.insert(key.query_id().to_string(), tier);
        }
        self.tier(tier.other()).remove(&key);
        self.tier(tier).insert(key, value, Instant::now());
    }

    /// Copy of the stored entry without counting a hit or refreshing recency.
    pub fn peek_entry(&self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        Tier::ALL
            .iter()
            .find_map(|t| self.tier(*t).entries.lock().peek(key).cloned())
    }

    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        let mut removed = false;
        for tier in Tier::ALL {
            if self.tier(tier).remove(key) {
                CACHE_EVICTIONS
                    .with_label_values(&[tier.as_str(), "invalidated"])
                    .inc();
                removed = true;
            }
        }
        removed
    }

    /// Drop every cached result of one query class, whatever its parameters.
    pub fn invalidate_query(&self, query_id: &str) -> usize {
        let mut removed = 0;
        for tier in Tier::ALL {
            let mut entries = self.tier(tier).entries.lock();
            let stale: Vec<Fingerprint> = entries
                .iter()
                .filter(|(k, _)| k.query_id() == query_id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                entries.pop(&key);
                CACHE_EVICTIONS
                    .with_label_values(&[tier.as_str(), "invalidated"])
                    .inc();
                removed += 1;
            }
        }
        debug!(query = query_id, entries = removed, "Invalidated query class");
        removed
    }

    pub fn invalidate_all(&self, tier: Tier) {
        let mut entries = self.tier(tier).entries.lock();
        let n = entries.len();
        entries.clear();
        CACHE_EVICTIONS
            .with_label_values(&[tier.as_str(), "invalidated"])
            .inc_by(n as u64);
        debug!(tier = tier.as_str(), entries = n, "Cleared cache tier");
    }

    pub fn stats(&self, tier: Tier) -> CacheTierStats {
        self.tier(tier).stats()
    }

    /// Stats for both tiers, for the diagnostics endpoint.
    pub fn all_stats(&self) -> Vec<CacheTierStats> {
        Tier::ALL.iter().map(|t| self.stats(*t)).collect()
    }
}
