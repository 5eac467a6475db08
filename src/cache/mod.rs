// Cache backends for the catalog read path. Redis in production, an in-process map
// for development and tests, and a no-op backend when caching is switched off.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CacheConfig;

pub mod key;
pub mod redis;

pub use self::key::CacheKey;
pub use self::redis::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

/// Key/value store used by the cache-aside layer.
///
/// `get` distinguishes a miss (`Ok(None)`) from a backend failure (`Err`), so callers
/// can fall back to the database without treating outages as empty results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() > expires_at)
            .unwrap_or(false)
    }
}

/// In-process cache with per-entry expiry
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<DashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Re-checks under the write lock, so a `set` that raced in after the read is kept.
    fn evict_if_expired(&self, key: &str) {
        self.store.remove_if(key, |_, entry| entry.is_expired());
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.store.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.evict_if_expired(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.store
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(key);
        Ok(())
    }
}

/// Backend that never stores anything; every read is a miss.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

pub struct CacheFactory;

impl CacheFactory {
    /// Builds the configured backend. An unreachable Redis degrades to the in-memory cache
    /// instead of failing startup.
    pub async fn create_cache(config: &CacheConfig) -> Arc<dyn CacheBackend> {
        match config.backend.to_ascii_lowercase().as_str() {
            "disabled" => {
                info!("Catalog cache disabled");
                Arc::new(NoopCache)
            }
            "redis" => match RedisCache::connect(&config.redis_url).await {
                Ok(cache) => {
                    info!("Catalog cache backed by Redis");
                    Arc::new(cache)
                }
                Err(e) => {
                    warn!("Failed to connect to Redis, falling back to in-memory cache: {}", e);
                    Arc::new(InMemoryCache::new())
                }
            },
            _ => Arc::new(InMemoryCache::new()),
        }
    }
}
