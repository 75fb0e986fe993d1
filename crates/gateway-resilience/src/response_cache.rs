//! Content-addressed response cache.
//!
//! Requests are projected down to the fields that affect the provider's
//! output, canonicalized (recursively sorted object keys) and digested
//! with SHA-256, so semantically identical requests share a cache entry
//! regardless of incidental differences such as request ids or headers.
//!
//! The store sits behind an async [`CacheBackend`] trait with an in-memory
//! default; an externally shared store can plug in behind the same trait
//! for multi-instance deployments. Backend faults never fail a request:
//! reads degrade to a miss and writes are best-effort.

use async_trait::async_trait;
use gateway_config::CacheSettings;
use gateway_core::{GatewayRequest, GatewayResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Prefix for all cache storage keys
pub const CACHE_KEY_PREFIX: &str = "ai-cache";

/// Hex characters kept from the digest for the storage key
const DIGEST_PREFIX_LEN: usize = 16;

/// Error types for cache backend operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend unreachable or unhealthy
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// Entry could not be (de)serialized
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// Backend operation timed out
    #[error("cache operation timeout after {0:?}")]
    Timeout(Duration),
}

/// Result type for cache backend operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache backend trait for polymorphic storage implementations
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the cache
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value in the cache with TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Delete a key from the cache
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete all keys matching a `prefix*` pattern, returning the count
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64>;

    /// Check if the backend is healthy
    async fn health_check(&self) -> CacheResult<()>;

    /// Backend name for metrics and logs
    fn name(&self) -> &'static str;

    /// Whether the backend is shared across gateway instances
    fn is_distributed(&self) -> bool;
}

/// Local cache entry with instant-based expiry
#[derive(Debug)]
struct LocalEntry {
    data: Vec<u8>,
    expires_at: Instant,
    hits: u64,
}

/// In-memory cache backend for single-instance deployments
pub struct MemoryCacheBackend {
    entries: Arc<RwLock<HashMap<String, LocalEntry>>>,
    max_entries: usize,
}

impl MemoryCacheBackend {
    /// Create a new memory cache backend
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
        }
    }

    /// Evict expired entries, then lowest-hit entries if still over capacity
    async fn evict_if_needed(&self) {
        let mut entries = self.entries.write().await;

        entries.retain(|_, entry| entry.expires_at > Instant::now());

        if entries.len() >= self.max_entries {
            let to_remove = entries.len() - self.max_entries + 1;
            let mut by_hits: Vec<(String, u64)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.hits))
                .collect();
            by_hits.sort_by_key(|(_, hits)| *hits);

            for (key, _) in by_hits.into_iter().take(to_remove) {
                entries.remove(&key);
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.expires_at <= Instant::now() {
                entries.remove(key);
                return Ok(None);
            }
            entry.hits += 1;
            return Ok(Some(entry.data.clone()));
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.evict_if_needed().await;

        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            LocalEntry {
                data: value,
                expires_at: Instant::now() + ttl,
                hits: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let mut entries = self.entries.write().await;

        let prefix = pattern.trim_end_matches('*');
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));

        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> CacheResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Normalized projection of a request: only fields that affect the
/// provider's output participate in the cache key.
#[derive(Serialize)]
struct CacheKeyFields<'a> {
    model: &'a str,
    messages: Vec<KeyMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a gateway_core::EmbeddingInput>,
}

#[derive(Serialize)]
struct KeyMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Recursively sort object keys so serialization is deterministic
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map.into_iter().collect();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Derive the storage key for a request: `ai-cache:<16-hex>`
#[must_use]
pub fn cache_key(request: &GatewayRequest) -> String {
    let fields = CacheKeyFields {
        model: &request.model,
        messages: request
            .messages
            .iter()
            .map(|m| KeyMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        input: request.input.as_ref(),
    };

    let value = serde_json::to_value(&fields).unwrap_or(Value::Null);
    let canonical = canonicalize(value);
    let serialized = canonical.to_string();

    let digest = Sha256::digest(serialized.as_bytes());
    let hex_digest = hex::encode(digest);
    format!("{CACHE_KEY_PREFIX}:{}", &hex_digest[..DIGEST_PREFIX_LEN])
}

/// Stored cache entry with its capture metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    /// The cached response
    pub response: GatewayResponse,
    /// HTTP status of the original dispatch
    pub status: u16,
    /// When the entry was captured (Unix seconds)
    pub created_at: u64,
    /// TTL in seconds
    pub ttl_secs: u64,
}

impl CachedEntry {
    fn new(response: GatewayResponse, status: u16, ttl: Duration) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            response,
            status,
            created_at,
            ttl_secs: ttl.as_secs(),
        }
    }

    /// An entry is served only while `now - created_at < ttl`
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        now >= self.created_at + self.ttl_secs
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseCacheStats {
    /// Entries served from cache
    pub hits: u64,
    /// Lookups that proceeded to dispatch
    pub misses: u64,
    /// Backend faults absorbed as misses
    pub backend_errors: u64,
}

/// Content-addressed response cache over a pluggable backend
pub struct ResponseCache {
    settings: CacheSettings,
    backend: Arc<dyn CacheBackend>,
    hits: AtomicU64,
    misses: AtomicU64,
    backend_errors: AtomicU64,
}

impl ResponseCache {
    /// Create a cache over the given backend
    #[must_use]
    pub fn new(settings: CacheSettings, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            settings,
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Create with the in-memory backend
    #[must_use]
    pub fn in_memory(settings: CacheSettings) -> Self {
        let max_entries = settings.max_entries;
        Self::new(settings, Arc::new(MemoryCacheBackend::new(max_entries)))
    }

    /// Whether a request participates in caching at all.
    ///
    /// Streaming responses are never cached.
    #[must_use]
    pub fn is_cacheable(&self, request: &GatewayRequest) -> bool {
        self.settings.enabled && !request.stream
    }

    /// Look up a cached response.
    ///
    /// TTL is enforced here; expired entries are deleted and reported as a
    /// miss. Backend faults are absorbed as misses so the request proceeds
    /// to dispatch.
    pub async fn get(&self, request: &GatewayRequest) -> Option<GatewayResponse> {
        if !self.is_cacheable(request) {
            return None;
        }

        let key = cache_key(request);
        match self.backend.get(&key).await {
            Ok(Some(data)) => match serde_json::from_slice::<CachedEntry>(&data) {
                Ok(entry) if !entry.is_expired() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, model = %request.model, "cache hit");
                    Some(entry.response)
                }
                Ok(_) => {
                    let _ = self.backend.delete(&key).await;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to deserialize cache entry");
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                // Fail open: a broken cache store must not fail the request
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache backend fault, treating as miss");
                None
            }
        }
    }

    /// Store a dispatched response. Only 2xx outcomes are cached and the
    /// write is best-effort.
    pub async fn put(&self, request: &GatewayRequest, response: &GatewayResponse, status: u16) {
        if !self.is_cacheable(request) || !(200..300).contains(&status) {
            return;
        }

        let key = cache_key(request);
        let entry = CachedEntry::new(response.clone(), status, self.settings.ttl);
        let data = match serde_json::to_vec(&entry) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialize cache entry");
                return;
            }
        };

        if let Err(e) = self.backend.set(&key, data, self.settings.ttl).await {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "cache write failed");
        }
    }

    /// Remove all entries, returning the number removed
    pub async fn invalidate_all(&self) -> u64 {
        match self
            .backend
            .delete_pattern(&format!("{CACHE_KEY_PREFIX}:*"))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "cache invalidation failed");
                0
            }
        }
    }

    /// Remove a single entry by its storage key
    pub async fn invalidate(&self, key: &str) -> bool {
        self.backend.delete(key).await.is_ok()
    }

    /// Hit/miss counters
    #[must_use]
    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    /// Backend health, for the readiness probe
    pub async fn health_check(&self) -> CacheResult<()> {
        self.backend.health_check().await
    }
}
