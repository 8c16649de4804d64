//! Store Lifecycle Tests
//!
//! Tests for data surviving restarts of the offline store.

use chrono::Utc;
use hazard_offline::{
    KvConfig, OfflineConfig, OfflineStore, ProfileSnapshot, ReportStatus, SCHEMA_VERSION,
};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const CRASH_STORE_ENV: &str = "HAZARD_OFFLINE_CRASH_STORE";

fn config_in(dir: &TempDir) -> OfflineConfig {
    config_at(&dir.path().join("offline.db"))
}

// background flushing off, so only explicit flushes reach disk
fn config_at(path: &Path) -> OfflineConfig {
    let path = path.to_string_lossy().to_string();
    OfflineConfig::default().store(
        KvConfig::new(path)
            .schema_version(SCHEMA_VERSION)
            .flush_every_ms(None),
    )
}

/// Test queued reports, cache and profile survive a restart
#[tokio::test]
async fn test_data_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let before = Utc::now();

    // Phase 1: write everything and shut down
    let (first, second) = {
        let store = OfflineStore::open(config_in(&temp_dir)).await.unwrap();
        let first = store
            .reports()
            .enqueue(&json!({ "hazard": "flood", "lat": 51.5 }))
            .await
            .unwrap();
        let second = store
            .reports()
            .enqueue(&json!({ "hazard": "pothole" }))
            .await
            .unwrap();
        store
            .reports()
            .mark_status(second, ReportStatus::Failed, Some("HTTP 503"))
            .await
            .unwrap();
        store
            .cache()
            .put_default("/api/hazards", json!({ "count": 12 }))
            .await
            .unwrap();
        store.profile().save(&json!({ "username": "ana" })).await.unwrap();
        store.kv().await.unwrap().flush().await.unwrap();
        (first, second)
    };

    // Phase 2: reopen and verify
    let store = OfflineStore::open(config_in(&temp_dir)).await.unwrap();

    let pending = store.reports().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first);
    assert_eq!(pending[0].payload["lat"], 51.5);
    assert!(pending[0].created_at >= before);

    let failed = store.reports().get(second).await.unwrap().unwrap();
    assert_eq!(failed.status, ReportStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("HTTP 503"));

    let cached: Option<Value> = store.cache().get("/api/hazards").await.unwrap();
    assert_eq!(cached, Some(json!({ "count": 12 })));

    let profile: ProfileSnapshot = store.profile().load().await.unwrap().unwrap();
    assert_eq!(profile.profile["username"], "ana");

    // new ids never reuse old ones
    let third = store.reports().enqueue(&json!({})).await.unwrap();
    assert!(third > second);
}

/// Test a second opener of the same path sees storage as unavailable
#[tokio::test]
async fn test_second_opener_is_refused() {
    let temp_dir = TempDir::new().unwrap();

    let _first = OfflineStore::open(config_in(&temp_dir)).await.unwrap();
    let second = OfflineStore::open(config_in(&temp_dir)).await;

    assert!(second.err().unwrap().is_storage_unavailable());
}

/// Test opening is deferred until first use
#[tokio::test]
async fn test_lazy_open_on_first_use() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("offline.db");

    let store = OfflineStore::new(config_in(&temp_dir));
    assert!(!path.exists());

    store.stats().await.unwrap();
    assert!(path.exists());
}

/// Enqueue one report and die without any shutdown; run by the crash test below
#[tokio::test]
#[ignore = "spawned as a child process by test_enqueued_report_survives_crash"]
async fn enqueue_then_abort() {
    let Ok(path) = std::env::var(CRASH_STORE_ENV) else {
        return;
    };

    let store = OfflineStore::open(config_at(Path::new(&path))).await.unwrap();
    store
        .reports()
        .enqueue(&json!({ "hazard": "flood" }))
        .await
        .unwrap();
    std::process::abort();
}

/// Test an acknowledged report is on disk even if the process dies right after
#[tokio::test]
async fn test_enqueued_report_survives_crash() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("offline.db");

    let status = Command::new(std::env::current_exe().unwrap())
        .args(["enqueue_then_abort", "--exact", "--ignored", "--nocapture"])
        .env(CRASH_STORE_ENV, &path)
        .status()
        .unwrap();
    assert!(!status.success());

    let store = OfflineStore::open(config_at(&path)).await.unwrap();
    let pending = store.reports().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["hazard"], "flood");
}
