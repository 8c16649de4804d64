//! Pending-report queue
//!
//! Hazard reports submitted while offline are written here and tracked through
//! `pending -> syncing -> synced | failed` until a sync driver uploads them.
//! Every write is flushed to disk before the call returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::collection::{
    Collection, CollectionSchema, IndexKind, IndexValue, KeyKind, RecordKey, Updated,
};
use crate::kv::{KvError, StoreHandle};

/// Collection holding queued reports
pub const REPORTS_COLLECTION: &str = "pending-reports";
/// Secondary index on report status
pub const STATUS_INDEX: &str = "status";
/// Secondary index on creation time
pub const CREATED_AT_INDEX: &str = "created_at";

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage error
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No report with this id
    #[error("Report not found: {0}")]
    NotFound(u64),

    /// Status change not allowed by the report lifecycle
    #[error("Report {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Report id
        id: u64,
        /// Current status
        from: ReportStatus,
        /// Requested status
        to: ReportStatus,
    },
}

impl QueueError {
    /// Whether the underlying storage failed
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, QueueError::Kv(e) if e.is_storage_unavailable())
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Upload status of a queued report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Waiting for upload
    Pending,
    /// Upload in progress
    Syncing,
    /// Uploaded; terminal until removed
    Synced,
    /// Last upload attempt failed
    Failed,
}

impl ReportStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [ReportStatus; 4] = [
        ReportStatus::Pending,
        ReportStatus::Syncing,
        ReportStatus::Synced,
        ReportStatus::Failed,
    ];

    /// Wire name, as stored in the status index
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Syncing => "syncing",
            ReportStatus::Synced => "synced",
            ReportStatus::Failed => "failed",
        }
    }

    /// Whether a report in this status may move to `next`
    ///
    /// `synced` only ever moves to `synced` again. Claiming a report for upload
    /// (`syncing`) works only from `pending` or `failed`, so two sync passes
    /// cannot both claim it.
    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        match (self, next) {
            (ReportStatus::Synced, next) => next == ReportStatus::Synced,
            (_, ReportStatus::Syncing) => {
                matches!(self, ReportStatus::Pending | ReportStatus::Failed)
            }
            _ => true,
        }
    }

    fn index_value(&self) -> IndexValue {
        IndexValue::from(self.as_str())
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally queued hazard report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReport {
    /// Local id (not the server id)
    pub id: u64,
    /// Report fields as submitted; opaque to the queue
    pub payload: Value,
    /// When the report was queued
    pub created_at: DateTime<Utc>,
    /// Upload status
    pub status: ReportStatus,
    /// Number of failed upload attempts
    pub retry_count: u32,
    /// Reason for the last failure
    pub last_error: Option<String>,
    /// When the upload succeeded
    pub synced_at: Option<DateTime<Utc>>,
}

impl PendingReport {
    fn new(id: u64, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            created_at: now,
            status: ReportStatus::Pending,
            retry_count: 0,
            last_error: None,
            synced_at: None,
        }
    }

    fn apply(&mut self, status: ReportStatus, error: Option<&str>, now: DateTime<Utc>) {
        match status {
            ReportStatus::Synced => {
                self.synced_at = Some(now);
                self.last_error = None;
            }
            ReportStatus::Failed => {
                self.last_error = error.map(str::to_string);
                self.retry_count += 1;
            }
            ReportStatus::Pending | ReportStatus::Syncing => {}
        }
        self.status = status;
    }
}

/// Queue of reports awaiting upload
///
/// Clones share the store and the sync pass lock.
#[derive(Clone)]
pub struct ReportQueue {
    store: Arc<StoreHandle>,
    sync_pass: Arc<Mutex<()>>,
}

impl ReportQueue {
    /// Collection declaration for the queue
    pub fn schema() -> CollectionSchema {
        CollectionSchema::new(REPORTS_COLLECTION, "id", KeyKind::Sequential)
            .index(STATUS_INDEX, "status", IndexKind::Text)
            .index(CREATED_AT_INDEX, "created_at", IndexKind::Timestamp)
    }

    /// Create a queue over a shared store handle
    pub fn new(store: Arc<StoreHandle>) -> Self {
        Self {
            store,
            sync_pass: Arc::new(Mutex::new(())),
        }
    }

    /// Held by a sync driver for the length of a pass
    pub(crate) fn sync_pass(&self) -> &Mutex<()> {
        &self.sync_pass
    }

    async fn collection(&self) -> Result<Collection> {
        Ok(self.store.collection(REPORTS_COLLECTION).await?)
    }

    /// Queue a report; returns its local id
    pub async fn enqueue<P>(&self, payload: &P) -> Result<u64>
    where
        P: Serialize,
    {
        self.enqueue_json(serde_json::to_value(payload)?).await
    }

    /// Queue a report given as raw JSON
    pub async fn enqueue_json(&self, payload: Value) -> Result<u64> {
        let reports = self.collection().await?;
        let now = Utc::now();
        let id = reports.insert_with_id(|id| PendingReport::new(id, payload, now))?;
        reports.flush().await?;
        tracing::debug!("Queued report {}", id);
        Ok(id)
    }

    /// Get a report by id
    pub async fn get(&self, id: u64) -> Result<Option<PendingReport>> {
        Ok(self.collection().await?.get(&RecordKey::Id(id))?)
    }

    /// Reports waiting for upload, in no particular order
    pub async fn list_pending(&self) -> Result<Vec<PendingReport>> {
        self.list_by_status(ReportStatus::Pending).await
    }

    /// Reports with the given status, in no particular order
    pub async fn list_by_status(&self, status: ReportStatus) -> Result<Vec<PendingReport>> {
        Ok(self
            .collection()
            .await?
            .find_by_index(STATUS_INDEX, &status.index_value())?)
    }

    /// Every queued report, oldest first
    pub async fn list_all(&self) -> Result<Vec<PendingReport>> {
        let mut reports: Vec<PendingReport> = self.collection().await?.values()?;
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(reports)
    }

    /// Number of reports with the given status
    pub async fn count_by_status(&self, status: ReportStatus) -> Result<usize> {
        Ok(self
            .collection()
            .await?
            .count_by_index(STATUS_INDEX, &status.index_value())?)
    }

    /// Move a report to `status`
    ///
    /// `synced` stamps `synced_at` and clears the last error; `failed` records
    /// `error` and bumps `retry_count` once per call. The read and the write
    /// happen in one transaction.
    pub async fn mark_status(
        &self,
        id: u64,
        status: ReportStatus,
        error: Option<&str>,
    ) -> Result<PendingReport> {
        let reports = self.collection().await?;
        let now = Utc::now();

        let outcome = reports.update(&RecordKey::Id(id), |report: &mut PendingReport| {
            if !report.status.can_transition_to(status) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: report.status,
                    to: status,
                });
            }
            report.apply(status, error, now);
            Ok(true)
        })?;
        reports.flush().await?;

        match outcome {
            Updated::Written(report) | Updated::Unchanged(report) => {
                tracing::debug!("Report {} is now {}", id, status);
                Ok(report)
            }
            Updated::Missing => Err(QueueError::NotFound(id)),
        }
    }

    /// Delete a report; deleting a missing report is not an error
    pub async fn remove(&self, id: u64) -> Result<()> {
        let reports = self.collection().await?;
        if reports.remove(&RecordKey::Id(id))? {
            reports.flush().await?;
            tracing::debug!("Removed report {}", id);
        }
        Ok(())
    }

    /// Delete every synced report; returns how many were deleted
    ///
    /// Works from a snapshot of synced ids and re-checks each record as it is
    /// deleted.
    pub async fn purge_synced(&self) -> Result<usize> {
        let reports = self.collection().await?;
        let synced = reports.keys_by_index(STATUS_INDEX, &ReportStatus::Synced.index_value())?;

        let mut purged = 0;
        for key in synced {
            if reports.remove_if(&key, |report: &PendingReport| {
                report.status == ReportStatus::Synced
            })? {
                purged += 1;
            }
        }

        if purged > 0 {
            reports.flush().await?;
            tracing::info!("Purged {} synced reports", purged);
        }
        Ok(purged)
    }

    /// Move failed reports back to pending
    ///
    /// With `max_retries`, reports that already failed that many times stay
    /// failed. Returns how many reports were requeued.
    pub async fn requeue_failed(&self, max_retries: Option<u32>) -> Result<usize> {
        let reports = self.collection().await?;
        let failed = reports.keys_by_index(STATUS_INDEX, &ReportStatus::Failed.index_value())?;

        let mut requeued = 0;
        for key in failed {
            let outcome = reports.update(&key, |report: &mut PendingReport| {
                let under_limit = max_retries.map_or(true, |max| report.retry_count < max);
                if report.status != ReportStatus::Failed || !under_limit {
                    return Ok::<bool, QueueError>(false);
                }
                report.status = ReportStatus::Pending;
                Ok(true)
            })?;
            if matches!(outcome, Updated::Written(_)) {
                requeued += 1;
            }
        }
        if requeued > 0 {
            reports.flush().await?;
        }
        Ok(requeued)
    }

    /// Move reports stuck in `syncing` back to pending
    ///
    /// A report stays in `syncing` when the pass that claimed it never recorded
    /// an outcome (crash, aborted task, storage error). Only call this while no
    /// upload is in flight. `retry_count` is left alone. Returns how many
    /// reports were requeued.
    pub async fn requeue_syncing(&self) -> Result<usize> {
        let reports = self.collection().await?;
        let stuck = reports.keys_by_index(STATUS_INDEX, &ReportStatus::Syncing.index_value())?;

        let mut requeued = 0;
        for key in stuck {
            let outcome = reports.update(&key, |report: &mut PendingReport| {
                if report.status != ReportStatus::Syncing {
                    return Ok::<bool, QueueError>(false);
                }
                report.status = ReportStatus::Pending;
                Ok(true)
            })?;
            if matches!(outcome, Updated::Written(_)) {
                requeued += 1;
            }
        }
        if requeued > 0 {
            reports.flush().await?;
            tracing::info!("Requeued {} interrupted uploads", requeued);
        }
        Ok(requeued)
    }

    /// Delete every report regardless of status
    pub async fn clear(&self) -> Result<()> {
        let reports = self.collection().await?;
        reports.clear()?;
        reports.flush().await?;
        Ok(())
    }
}
