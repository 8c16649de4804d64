//! Connectivity tracking and report synchronization
//!
//! This module provides:
//! - [`NetworkMonitor`], the point-in-time connectivity flag the host keeps current
//! - [`ReportUploader`], the seam to whatever network client uploads reports
//! - [`SyncDriver`], which drains the pending-report queue when online
//!
//! Retry policy lives here, not in the queue: the driver requeues failed
//! reports that are still under [`SyncConfig::max_retries`]. Passes of all
//! drivers sharing one [`ReportQueue`] never overlap, and each pass first returns reports
//! left in `syncing` by an interrupted pass to the queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::cache::{CacheError, TtlCache};
use crate::queue::{PendingReport, QueueError, ReportQueue, ReportStatus};

/// Errors that can occur during synchronization
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Upload rejected or failed in transport
    #[error("Upload failed: {0}")]
    Upload(String),
}

impl SyncError {
    /// Whether the underlying storage failed
    pub fn is_storage_unavailable(&self) -> bool {
        match self {
            SyncError::Queue(e) => e.is_storage_unavailable(),
            SyncError::Cache(e) => e.is_storage_unavailable(),
            SyncError::Upload(_) => false,
        }
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Network connectivity state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkState {
    /// Connected to network
    Online,

    /// Disconnected from network
    Offline,

    /// Network state unknown
    #[default]
    Unknown,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => write!(f, "online"),
            NetworkState::Offline => write!(f, "offline"),
            NetworkState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Connectivity flag shared between the host and the sync driver
///
/// The host reports changes with [`NetworkMonitor::set_state`]; readers get a
/// point-in-time answer from [`NetworkMonitor::is_online`] or subscribe to
/// changes.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<RwLock<NetworkState>>,
    changes: broadcast::Sender<NetworkState>,
}

impl NetworkMonitor {
    /// Create a monitor starting in `initial`
    pub fn new(initial: NetworkState) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Arc::new(RwLock::new(initial)),
            changes,
        }
    }

    /// Current network state
    pub async fn state(&self) -> NetworkState {
        *self.state.read().await
    }

    /// Whether the host last reported being online; `Unknown` counts as offline
    pub async fn is_online(&self) -> bool {
        self.state().await == NetworkState::Online
    }

    /// Record a new network state, notifying subscribers if it changed
    pub async fn set_state(&self, state: NetworkState) {
        let mut current = self.state.write().await;
        if *current != state {
            tracing::info!("Network state changed from {} to {}", *current, state);
            *current = state;
            let _ = self.changes.send(state);
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
        self.changes.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::default())
    }
}

/// Uploads one report to the server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportUploader: Send + Sync {
    /// Upload a report; an `Err` is recorded on the report as its last error
    async fn upload(&self, report: &PendingReport) -> Result<()>;
}

/// Configuration for the sync driver
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Requeue failed reports at the start of each pass
    pub auto_retry: bool,

    /// Stop requeueing a report after this many failures (None = never stop)
    pub max_retries: Option<u32>,

    /// Delete synced reports at the end of each pass
    pub purge_synced: bool,

    /// Sweep expired cache entries at the end of each pass
    pub sweep_cache: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: Some(3),
            purge_synced: false,
            sweep_cache: true,
        }
    }
}

impl SyncConfig {
    /// Create a new sync configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable requeueing of failed reports
    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    /// Set the retry ceiling
    pub fn max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    /// Enable or disable purging synced reports after a pass
    pub fn purge_synced(mut self, enabled: bool) -> Self {
        self.purge_synced = enabled;
        self
    }

    /// Enable or disable the cache sweep after a pass
    pub fn sweep_cache(mut self, enabled: bool) -> Self {
        self.sweep_cache = enabled;
        self
    }
}

/// What one sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// The pass did nothing because the device was offline
    pub skipped_offline: bool,
    /// Reports left in `syncing` by an interrupted pass, moved back to pending
    pub recovered: usize,
    /// Failed reports moved back to pending
    pub requeued: usize,
    /// Reports handed to the uploader
    pub attempted: usize,
    /// Uploads that succeeded
    pub synced: usize,
    /// Uploads that failed
    pub failed: usize,
    /// Synced reports deleted afterwards
    pub purged: usize,
    /// Expired cache entries swept afterwards
    pub evicted: usize,
}

/// Drains the pending-report queue through a [`ReportUploader`]
#[derive(Clone)]
pub struct SyncDriver {
    queue: ReportQueue,
    cache: Option<TtlCache>,
    monitor: NetworkMonitor,
    uploader: Arc<dyn ReportUploader>,
    config: SyncConfig,
}

impl SyncDriver {
    /// Create a driver
    pub fn new(
        queue: ReportQueue,
        monitor: NetworkMonitor,
        uploader: Arc<dyn ReportUploader>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            cache: None,
            monitor,
            uploader,
            config,
        }
    }

    /// Sweep this cache at the end of each pass (see [`SyncConfig::sweep_cache`])
    pub fn with_cache(mut self, cache: TtlCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run one pass over the queue, oldest report first
    ///
    /// Does nothing while offline, and stops early if connectivity drops
    /// mid-pass. Upload failures are recorded on the report, not returned.
    /// A pass started while another is running waits for it to finish.
    pub async fn run_once(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        if !self.monitor.is_online().await {
            tracing::debug!("Skipping sync pass while offline");
            summary.skipped_offline = true;
            return Ok(summary);
        }

        let _pass = self.queue.sync_pass().lock().await;

        // nothing of ours is in flight while the pass lock is held
        summary.recovered = self.queue.requeue_syncing().await?;

        if self.config.auto_retry {
            summary.requeued = self.queue.requeue_failed(self.config.max_retries).await?;
        }

        let mut pending = self.queue.list_pending().await?;
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        for report in pending {
            if !self.monitor.is_online().await {
                tracing::info!("Connectivity lost, stopping sync pass");
                break;
            }

            let report = match self
                .queue
                .mark_status(report.id, ReportStatus::Syncing, None)
                .await
            {
                Ok(report) => report,
                // removed or finished by someone else since the listing
                Err(QueueError::NotFound(_)) | Err(QueueError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            summary.attempted += 1;

            let (status, error) = match self.uploader.upload(&report).await {
                Ok(()) => {
                    summary.synced += 1;
                    (ReportStatus::Synced, None)
                }
                Err(e) => {
                    tracing::warn!("Upload of report {} failed: {}", report.id, e);
                    summary.failed += 1;
                    (ReportStatus::Failed, Some(e.to_string()))
                }
            };

            match self.queue.mark_status(report.id, status, error.as_deref()).await {
                Ok(_) | Err(QueueError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.config.purge_synced {
            summary.purged = self.queue.purge_synced().await?;
        }
        if self.config.sweep_cache {
            if let Some(cache) = &self.cache {
                summary.evicted = cache.sweep().await?;
            }
        }

        tracing::info!(
            "Sync pass finished: {} attempted, {} synced, {} failed",
            summary.attempted,
            summary.synced,
            summary.failed
        );
        Ok(summary)
    }

    /// Run a pass every time the monitor reports coming online
    ///
    /// Runs until the storage becomes unavailable; otherwise pass errors are
    /// logged and the driver waits for the next reconnect. Drop the future (or
    /// abort its task) to stop it.
    pub async fn run_on_reconnect(&self) -> Result<()> {
        let mut changes = self.monitor.subscribe();
        loop {
            let reconnected = match changes.recv().await {
                Ok(state) => state == NetworkState::Online,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Missed {} network state changes", missed);
                    self.monitor.is_online().await
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };
            if !reconnected {
                continue;
            }

            match self.run_once().await {
                Ok(_) => {}
                Err(e) if e.is_storage_unavailable() => return Err(e),
                Err(e) => tracing::warn!("Sync pass failed: {}", e),
            }
        }
    }
}
