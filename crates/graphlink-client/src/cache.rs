//! TTL-bounded query result cache.
//!
//! Keys are derived from the normalized query text plus a canonical
//! serialization of the parameters, so syntactically-equivalent queries
//! with equal parameter sets share one entry. Storage sits behind an async
//! backend trait; the default backend is an in-process map, but a remote
//! store can slot in without touching callers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use graphlink_proto::{Params, QueryResult};

use crate::error::{Error, ErrorContext, ErrorReporter, TracingReporter};

/// Result cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all.
    pub enabled: bool,
    /// Maximum number of entries before the oldest is evicted.
    pub max_size: usize,
    /// Time-to-live for entries.
    pub ttl: Duration,
    /// Prefix prepended to every key.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            ttl: Duration::from_secs(300),
            key_prefix: "gl:".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for a disabled cache.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the maximum number of entries.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the entry time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Partial configuration update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct CacheConfigUpdate {
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New maximum size.
    pub max_size: Option<usize>,
    /// New time-to-live.
    pub ttl: Option<Duration>,
    /// New key prefix.
    pub key_prefix: Option<String>,
}

/// A cached query result with its expiry bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached result.
    pub value: QueryResult,
    /// When the entry was stored.
    pub inserted_at: Instant,
    /// Time-to-live at insertion.
    pub ttl: Duration,
}

impl CacheEntry {
    /// Whether this entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Cache hit/miss statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Successful stores.
    pub sets: u64,
    /// hits / (hits + misses), zero when no lookups happened.
    pub hit_rate: f64,
}

/// Storage behind the result cache.
///
/// The boundary is async so a remote store can implement it; the bundled
/// [`MemoryBackend`] resolves immediately. Faults returned here are
/// reported and degraded by [`ResultCache`], never propagated.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch an entry by key.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error>;
    /// Store an entry under a key, replacing any prior entry.
    async fn set(&self, key: String, entry: CacheEntry) -> Result<(), Error>;
    /// Remove an entry, reporting whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, Error>;
    /// Drop every entry.
    async fn clear(&self) -> Result<(), Error>;
    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, Error>;
    /// Current number of entries, live or expired.
    async fn len(&self) -> Result<usize, Error>;
    /// Evict the entry with the oldest insertion time.
    async fn evict_oldest(&self) -> Result<Option<String>, Error>;
}

/// In-process cache backend on a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn set(&self, key: String, entry: CacheEntry) -> Result<(), Error> {
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, Error> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.entries.clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, Error> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        Ok(before - self.entries.len())
    }

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.entries.len())
    }

    async fn evict_oldest(&self) -> Result<Option<String>, Error> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = &oldest {
            self.entries.remove(key);
        }
        Ok(oldest)
    }
}

/// Derive the cache key for a query and its parameters.
///
/// The query text is whitespace-collapsed and case-folded before hashing,
/// so formatting differences do not fragment the cache. Parameters hash
/// through their canonical JSON (object keys sorted), so equal maps built
/// in different orders collide onto the same key.
pub fn cache_key(prefix: &str, query: &str, params: Option<&Params>) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    let query_hash = hasher.finish();

    let mut hasher = DefaultHasher::new();
    match params {
        Some(p) if !p.is_empty() => {
            // BTreeMap keys iterate sorted; serde_json::Map is sorted too.
            serde_json::to_string(p).unwrap_or_default().hash(&mut hasher);
        }
        _ => ().hash(&mut hasher),
    }
    let params_hash = hasher.finish();

    format!("{prefix}{query_hash:016x}:{params_hash:016x}")
}

/// Keyed, TTL-bounded store of prior query results.
///
/// Lookups on expired entries miss lazily; `cleanup` reclaims them.
/// Results carrying an error are never stored. Backend faults degrade to
/// a miss (or `false`) after being reported.
pub struct ResultCache {
    config: parking_lot::RwLock<CacheConfig>,
    backend: Arc<dyn CacheBackend>,
    reporter: Arc<dyn ErrorReporter>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl ResultCache {
    /// Create a cache with the in-memory backend.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Create a cache over a custom backend.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
            backend,
            reporter: Arc::new(TracingReporter),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Replace the error reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Whether lookups and stores are active.
    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Look up a prior result.
    ///
    /// Returns `None` when disabled, missing, expired, or when the backend
    /// faults.
    pub async fn get(&self, query: &str, params: Option<&Params>) -> Option<QueryResult> {
        if !self.is_enabled() {
            return None;
        }

        let key = self.key_for(query, params);
        let entry = match self.backend.get(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.report_degraded(&e, "get");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match entry {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache hit");
                Some(entry.value)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a successful result.
    ///
    /// Results carrying an error are skipped; when the cache is full the
    /// oldest entry is evicted first.
    pub async fn set(&self, query: &str, result: &QueryResult, params: Option<&Params>) {
        if !self.is_enabled() || result.error.is_some() {
            return;
        }

        let (key, ttl, max_size) = {
            let config = self.config.read();
            (
                cache_key(&config.key_prefix, query, params),
                config.ttl,
                config.max_size,
            )
        };

        match self.backend.len().await {
            Ok(len) if len >= max_size => {
                if let Err(e) = self.backend.evict_oldest().await {
                    self.report_degraded(&e, "evict");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.report_degraded(&e, "len");
                return;
            }
        }

        let entry = CacheEntry {
            value: result.clone(),
            inserted_at: Instant::now(),
            ttl,
        };
        match self.backend.set(key, entry).await {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.report_degraded(&e, "set"),
        }
    }

    /// Remove one entry, reporting whether it existed.
    pub async fn delete(&self, query: &str, params: Option<&Params>) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let key = self.key_for(query, params);
        match self.backend.remove(&key).await {
            Ok(existed) => existed,
            Err(e) => {
                self.report_degraded(&e, "delete");
                false
            }
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.backend.clear().await {
            self.report_degraded(&e, "clear");
        }
    }

    /// Reclaim expired entries, returning how many were removed.
    pub async fn cleanup(&self) -> usize {
        match self.backend.purge_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(removed, "cache cleanup");
                }
                removed
            }
            Err(e) => {
                self.report_degraded(&e, "cleanup");
                0
            }
        }
    }

    /// Current hit/miss/store counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Apply a partial configuration update.
    ///
    /// Disabling the cache drops all entries. Raising the size bound
    /// preserves existing entries.
    pub async fn update_config(&self, update: CacheConfigUpdate) {
        let was_enabled = {
            let mut config = self.config.write();
            let was_enabled = config.enabled;
            if let Some(enabled) = update.enabled {
                config.enabled = enabled;
            }
            if let Some(max_size) = update.max_size {
                config.max_size = max_size;
            }
            if let Some(ttl) = update.ttl {
                config.ttl = ttl;
            }
            if let Some(prefix) = update.key_prefix {
                config.key_prefix = prefix;
            }
            was_enabled
        };

        if was_enabled && !self.is_enabled() {
            if let Err(e) = self.backend.clear().await {
                self.report_degraded(&e, "clear");
            }
        }
    }

    fn key_for(&self, query: &str, params: Option<&Params>) -> String {
        let config = self.config.read();
        cache_key(&config.key_prefix, query, params)
    }

    fn report_degraded(&self, error: &Error, operation: &'static str) {
        tracing::warn!(operation, error = %error, "cache backend fault, degrading to miss");
        self.reporter
            .report(error, &ErrorContext::new("result_cache", operation));
    }
}
