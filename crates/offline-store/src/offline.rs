//! Offline store facade
//!
//! Bundles the report queue, API cache and profile snapshot over one shared
//! store, and answers the questions the UI asks about offline state.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheConfig, CacheError, TtlCache};
use crate::collection::CollectionSchema;
use crate::kv::{KvConfig, KvError, KvStore, StoreHandle};
use crate::profile::{ProfileError, ProfileStore};
use crate::queue::{QueueError, ReportQueue, ReportStatus};
use crate::sync::{NetworkMonitor, NetworkState, ReportUploader, SyncConfig, SyncDriver};

/// Current on-disk layout version
pub const SCHEMA_VERSION: u32 = 1;

/// Every collection the offline store declares
pub fn schemas() -> Vec<CollectionSchema> {
    vec![
        ReportQueue::schema(),
        TtlCache::schema(),
        ProfileStore::schema(),
    ]
}

/// Offline store error types
#[derive(Debug, Error)]
pub enum OfflineError {
    /// KV store error
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Report queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Profile store error
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl OfflineError {
    /// Whether the underlying storage failed
    pub fn is_storage_unavailable(&self) -> bool {
        match self {
            OfflineError::Kv(e) => e.is_storage_unavailable(),
            OfflineError::Queue(e) => e.is_storage_unavailable(),
            OfflineError::Cache(e) => e.is_storage_unavailable(),
            OfflineError::Profile(e) => e.is_storage_unavailable(),
        }
    }
}

/// Result type for offline store operations
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Offline store configuration
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Storage settings
    pub store: KvConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Network state assumed until the host reports one
    pub initial_network: NetworkState,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            store: KvConfig::default().schema_version(SCHEMA_VERSION),
            cache: CacheConfig::default(),
            initial_network: NetworkState::default(),
        }
    }
}

impl OfflineConfig {
    /// Create a configuration storing data at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            store: KvConfig::new(path).schema_version(SCHEMA_VERSION),
            ..Self::default()
        }
    }

    /// Create a configuration backed by a temporary store
    pub fn in_memory() -> Self {
        Self {
            store: KvConfig::in_memory().schema_version(SCHEMA_VERSION),
            ..Self::default()
        }
    }

    /// Replace the storage settings
    pub fn store(mut self, store: KvConfig) -> Self {
        self.store = store;
        self
    }

    /// Replace the cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the initial network state
    pub fn initial_network(mut self, state: NetworkState) -> Self {
        self.initial_network = state;
        self
    }
}

/// Counts shown on the offline status screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Reports waiting for upload
    pub pending_count: usize,
    /// Reports with an upload in flight
    pub syncing_count: usize,
    /// Reports uploaded but not yet purged
    pub synced_count: usize,
    /// Reports whose last upload failed
    pub failed_count: usize,
    /// Cache entries on disk, including expired ones not yet evicted
    pub cached_entry_count: usize,
}

/// Entry point for the offline persistence layer
#[derive(Clone)]
pub struct OfflineStore {
    handle: Arc<StoreHandle>,
    reports: ReportQueue,
    cache: TtlCache,
    profile: ProfileStore,
    network: NetworkMonitor,
}

impl OfflineStore {
    /// Create the facade without touching disk; the store opens on first use
    pub fn new(config: OfflineConfig) -> Self {
        let handle = Arc::new(StoreHandle::new(config.store, schemas()));
        Self {
            reports: ReportQueue::new(Arc::clone(&handle)),
            cache: TtlCache::new(Arc::clone(&handle), config.cache),
            profile: ProfileStore::new(Arc::clone(&handle)),
            network: NetworkMonitor::new(config.initial_network),
            handle,
        }
    }

    /// Create the facade and open the store now, surfacing storage errors early
    pub async fn open(config: OfflineConfig) -> Result<Self> {
        let store = Self::new(config);
        store.handle.open().await?;
        Ok(store)
    }

    /// The pending-report queue
    pub fn reports(&self) -> &ReportQueue {
        &self.reports
    }

    /// The API response cache
    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// The profile snapshot
    pub fn profile(&self) -> &ProfileStore {
        &self.profile
    }

    /// The connectivity monitor the host keeps up to date
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// The underlying store, opening it if needed
    pub async fn kv(&self) -> Result<Arc<KvStore>> {
        Ok(self.handle.open().await?)
    }

    /// Build a sync driver over this store's queue, cache and monitor
    pub fn sync_driver(&self, uploader: Arc<dyn ReportUploader>, config: SyncConfig) -> SyncDriver {
        SyncDriver::new(self.reports.clone(), self.network.clone(), uploader, config)
            .with_cache(self.cache.clone())
    }

    /// Whether the host last reported being online
    pub async fn is_online(&self) -> bool {
        self.network.is_online().await
    }

    /// Delete every report, cache entry and the profile snapshot
    ///
    /// Used on sign-out. Each collection is cleared in turn; if one fails the
    /// error is returned and later collections are left alone.
    pub async fn purge_all(&self) -> Result<()> {
        self.reports.clear().await?;
        self.cache.clear().await?;
        self.profile.clear().await?;
        tracing::info!("Purged all offline data");
        Ok(())
    }

    /// Count reports by status and cache entries
    ///
    /// Read-only: expired cache entries are counted, not evicted.
    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            pending_count: self.reports.count_by_status(ReportStatus::Pending).await?,
            syncing_count: self.reports.count_by_status(ReportStatus::Syncing).await?,
            synced_count: self.reports.count_by_status(ReportStatus::Synced).await?,
            failed_count: self.reports.count_by_status(ReportStatus::Failed).await?,
            cached_entry_count: self.cache.len().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> OfflineStore {
        OfflineStore::new(OfflineConfig::in_memory())
    }

    #[tokio::test]
    async fn test_lazy_open() {
        let store = store();
        assert!(!store.handle.is_open());

        store.stats().await.unwrap();
        assert!(store.handle.is_open());
    }

    #[tokio::test]
    async fn test_declares_all_collections() {
        let store = OfflineStore::open(OfflineConfig::in_memory()).await.unwrap();
        let kv = store.kv().await.unwrap();

        assert_eq!(
            kv.collection_names(),
            vec!["cached-data", "pending-reports", "user-profile"]
        );
        assert_eq!(kv.schema_version(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = store();
        let reports = store.reports();

        let a = reports.enqueue(&json!({ "n": 1 })).await.unwrap();
        let b = reports.enqueue(&json!({ "n": 2 })).await.unwrap();
        reports.enqueue(&json!({ "n": 3 })).await.unwrap();

        reports.mark_status(a, ReportStatus::Synced, None).await.unwrap();
        reports
            .mark_status(b, ReportStatus::Failed, Some("timeout"))
            .await
            .unwrap();
        store.cache().put_default("/api/me", json!({})).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                pending_count: 1,
                syncing_count: 0,
                synced_count: 1,
                failed_count: 1,
                cached_entry_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_stats_does_not_evict() {
        let store = store();
        store
            .cache()
            .put("stale", json!(1), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.stats().await.unwrap().cached_entry_count, 1);
        assert_eq!(store.stats().await.unwrap().cached_entry_count, 1);

        assert_eq!(store.cache().get("stale").await.unwrap(), None);
        assert_eq!(store.stats().await.unwrap().cached_entry_count, 0);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let store = store();
        store.reports().enqueue(&json!({})).await.unwrap();
        store.cache().put_default("k", json!(1)).await.unwrap();
        store.profile().save(&json!({ "username": "jo" })).await.unwrap();

        store.purge_all().await.unwrap();

        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        let profile: Option<crate::profile::ProfileSnapshot> = store.profile().load().await.unwrap();
        assert!(profile.is_none());
    }

    #[tokio::test]
    async fn test_is_online_follows_monitor() {
        let store = OfflineStore::new(
            OfflineConfig::in_memory().initial_network(NetworkState::Online),
        );
        assert!(store.is_online().await);

        store.network().set_state(NetworkState::Offline).await;
        assert!(!store.is_online().await);
    }

    #[tokio::test]
    async fn test_storage_unavailable_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("db");

        let err = OfflineStore::open(OfflineConfig::new(path.to_string_lossy()))
            .await
            .err()
            .unwrap();
        assert!(err.is_storage_unavailable());
    }
}
