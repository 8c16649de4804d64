//! Offline Sync Scenario Tests
//!
//! End-to-end tests for queueing reports offline and draining them once the
//! device reconnects.

use async_trait::async_trait;
use hazard_offline::{
    NetworkState, OfflineConfig, OfflineStore, PendingReport, ReportStatus, ReportUploader,
    SyncConfig, SyncError,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Uploader that records what it was sent and rejects chosen hazards
#[derive(Default)]
struct RecordingUploader {
    uploaded: Mutex<Vec<u64>>,
    reject: Option<&'static str>,
}

#[async_trait]
impl ReportUploader for RecordingUploader {
    async fn upload(&self, report: &PendingReport) -> Result<(), SyncError> {
        if self.reject == report.payload["hazard"].as_str() {
            return Err(SyncError::Upload("server rejected report".to_string()));
        }
        self.uploaded.lock().unwrap().push(report.id);
        Ok(())
    }
}

fn offline_store() -> OfflineStore {
    OfflineStore::new(OfflineConfig::in_memory().initial_network(NetworkState::Offline))
}

/// Test reports submitted offline are uploaded in order after reconnecting
#[tokio::test]
async fn test_reports_queue_offline_and_sync_on_reconnect() {
    let store = offline_store();
    let uploader = Arc::new(RecordingUploader::default());
    let driver = store.sync_driver(uploader.clone(), SyncConfig::new());

    // Phase 1: submit while offline
    let mut ids = Vec::new();
    for hazard in ["flood", "landslide", "fallen tree"] {
        ids.push(store.reports().enqueue(&json!({ "hazard": hazard })).await.unwrap());
    }
    assert!(!store.is_online().await);
    assert_eq!(store.stats().await.unwrap().pending_count, 3);

    let summary = driver.run_once().await.unwrap();
    assert!(summary.skipped_offline);
    assert!(uploader.uploaded.lock().unwrap().is_empty());

    // Phase 2: reconnect and drain
    store.network().set_state(NetworkState::Online).await;
    let summary = driver.run_once().await.unwrap();
    assert_eq!(summary.synced, 3);
    assert_eq!(*uploader.uploaded.lock().unwrap(), ids);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.synced_count, 3);

    for report in store.reports().list_all().await.unwrap() {
        assert!(report.synced_at.is_some());
    }

    // Phase 3: clean up uploaded reports
    assert_eq!(store.reports().purge_synced().await.unwrap(), 3);
    assert_eq!(store.stats().await.unwrap().synced_count, 0);
}

/// Test a rejected report stays failed while the rest sync
#[tokio::test]
async fn test_failed_report_is_retried_until_ceiling() {
    let store = offline_store();
    let uploader = Arc::new(RecordingUploader {
        reject: Some("sinkhole"),
        ..Default::default()
    });
    let driver = store.sync_driver(uploader, SyncConfig::new().max_retries(Some(2)));

    store.reports().enqueue(&json!({ "hazard": "flood" })).await.unwrap();
    let bad = store
        .reports()
        .enqueue(&json!({ "hazard": "sinkhole" }))
        .await
        .unwrap();

    store.network().set_state(NetworkState::Online).await;
    for _ in 0..4 {
        driver.run_once().await.unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.synced_count, 1);
    assert_eq!(stats.failed_count, 1);

    let report = store.reports().get(bad).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.retry_count, 2);
    assert_eq!(
        report.last_error.as_deref(),
        Some("Upload failed: server rejected report")
    );
}

/// Test the background driver reacts to connectivity changes
#[tokio::test]
async fn test_driver_runs_when_connectivity_returns() {
    let store = offline_store();
    let driver = store.sync_driver(Arc::new(RecordingUploader::default()), SyncConfig::new());
    store.reports().enqueue(&json!({ "hazard": "ice" })).await.unwrap();

    let task = tokio::spawn(async move { driver.run_on_reconnect().await });
    tokio::task::yield_now().await;
    store.network().set_state(NetworkState::Online).await;

    let mut synced = 0;
    for _ in 0..100 {
        synced = store.stats().await.unwrap().synced_count;
        if synced == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    task.abort();
    assert_eq!(synced, 1);
}

/// Test sign-out wipes every collection
#[tokio::test]
async fn test_purge_all_on_sign_out() {
    let store = offline_store();

    store.reports().enqueue(&json!({ "hazard": "flood" })).await.unwrap();
    store
        .cache()
        .put_default("/api/hazards/nearby", json!([{ "id": 7 }]))
        .await
        .unwrap();
    store
        .profile()
        .save(&json!({ "username": "ana", "points": 40 }))
        .await
        .unwrap();

    store.purge_all().await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.cached_entry_count, 0);
    let profile: Option<hazard_offline::ProfileSnapshot> = store.profile().load().await.unwrap();
    assert!(profile.is_none());
}

/// Test stats counts expired cache entries without evicting them
#[tokio::test]
async fn test_stats_leaves_expired_entries_alone() {
    let store = offline_store();
    let cache = store.cache();

    cache.put("/api/stale", json!(1), Duration::ZERO).await.unwrap();
    cache
        .put("/api/fresh", json!(2), Duration::from_secs(3600))
        .await
        .unwrap();

    assert_eq!(store.stats().await.unwrap().cached_entry_count, 2);
    assert_eq!(store.stats().await.unwrap().cached_entry_count, 2);

    assert_eq!(cache.sweep().await.unwrap(), 1);
    assert_eq!(store.stats().await.unwrap().cached_entry_count, 1);
}
