//! TTL cache for API responses
//!
//! This module provides a persistent cache keyed by caller-chosen strings
//! (usually the API path). Expired entries are never returned: a read of a stale
//! entry deletes it, and [`TtlCache::sweep`] removes the ones nobody reads again.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::collection::{Collection, CollectionSchema, IndexKind, KeyKind, RecordKey};
use crate::kv::{KvError, StoreHandle};

/// Collection holding cache entries
pub const CACHE_COLLECTION: &str = "cached-data";
/// Secondary index on expiry time
pub const EXPIRY_INDEX: &str = "expiry";

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// KV store error
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether the underlying storage failed
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, CacheError::Kv(e) if e.is_storage_unavailable())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache entry with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// The cached payload
    pub data: Value,
    /// When the entry goes stale
    pub expiry: DateTime<Utc>,
    /// When the entry was written
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(key: String, data: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            data,
            expiry: expiry_after(now, ttl),
            cached_at: now,
        }
    }

    /// Whether the entry is stale at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

// 9999-12-31T23:59:59Z, the last instant RFC 3339 can spell
const FAR_FUTURE_SECS: i64 = 253_402_300_799;

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let far_future =
        DateTime::<Utc>::from_timestamp(FAR_FUTURE_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map_or(far_future, |expiry| expiry.min(far_future))
}

/// Delete `key` if it is still expired at `now`
///
/// The entry is re-read inside the delete, so one refreshed by a concurrent
/// put after the caller saw it expired is kept.
fn evict_expired(entries: &Collection, key: &RecordKey, now: DateTime<Utc>) -> Result<bool> {
    Ok(entries.remove_if(key, |entry: &CacheEntry| entry.is_expired_at(now))?)
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when the caller does not pass one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60), // 1 hour
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Persistent cache with per-entry expiry
#[derive(Clone)]
pub struct TtlCache {
    store: Arc<StoreHandle>,
    config: CacheConfig,
}

impl TtlCache {
    /// Collection declaration for the cache
    pub fn schema() -> CollectionSchema {
        CollectionSchema::new(CACHE_COLLECTION, "key", KeyKind::Text).index(
            EXPIRY_INDEX,
            "expiry",
            IndexKind::Timestamp,
        )
    }

    /// Create a cache over a shared store handle
    pub fn new(store: Arc<StoreHandle>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    async fn collection(&self) -> Result<Collection> {
        Ok(self.store.collection(CACHE_COLLECTION).await?)
    }

    /// Store `data` under `key` for `ttl`, replacing any previous entry
    pub async fn put(&self, key: impl Into<String>, data: Value, ttl: Duration) -> Result<()> {
        let key = key.into();
        let entry = CacheEntry::new(key.clone(), data, ttl, Utc::now());
        self.collection().await?.put(&RecordKey::Name(key), &entry)?;
        Ok(())
    }

    /// Store `data` under `key` for the configured default TTL
    pub async fn put_default(&self, key: impl Into<String>, data: Value) -> Result<()> {
        self.put(key, data, self.config.default_ttl).await
    }

    /// Serialize and store a typed value
    pub async fn put_as<T>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize,
    {
        let data = serde_json::to_value(value)?;
        self.put(key, data, ttl.unwrap_or(self.config.default_ttl)).await
    }

    /// Get a live entry's payload
    ///
    /// A stale entry is deleted and reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.collection().await?;
        let key = RecordKey::from(key);

        let Some(entry) = entries.get::<CacheEntry>(&key)? else {
            return Ok(None);
        };

        let now = Utc::now();
        if !entry.is_expired_at(now) {
            return Ok(Some(entry.data));
        }

        if evict_expired(&entries, &key, now)? {
            tracing::debug!("Evicted expired cache entry {}", key);
        }
        Ok(None)
    }

    /// Get and deserialize a live entry
    pub async fn get_as<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Remove an entry; returns whether one existed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.collection().await?.remove(&RecordKey::from(key))?)
    }

    /// Delete every expired entry; returns how many were deleted
    pub async fn sweep(&self) -> Result<usize> {
        let entries = self.collection().await?;
        let now = Utc::now();

        let mut evicted = 0;
        for key in entries.keys_up_to(EXPIRY_INDEX, now.timestamp_millis())? {
            if evict_expired(&entries, &key, now)? {
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!("Swept {} expired cache entries", evicted);
        }
        Ok(evicted)
    }

    /// Delete every entry
    pub async fn clear(&self) -> Result<()> {
        self.collection().await?.clear()?;
        Ok(())
    }

    /// Number of stored entries, expired or not
    pub async fn len(&self) -> Result<usize> {
        Ok(self.collection().await?.len())
    }

    /// Check if the cache holds no entries
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
