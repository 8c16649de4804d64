//! Offline persistence for the hazard-reporting app
//!
//! This crate keeps hazard reports, API responses and the user's profile on the
//! device so the app keeps working without a connection, and drains queued
//! reports to the server once it comes back online.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod collection;
pub mod kv;
pub mod offline;
pub mod profile;
pub mod queue;
pub mod sync;

pub use cache::{CacheConfig, CacheEntry, CacheError, TtlCache};
pub use collection::{Collection, CollectionSchema, IndexKind, IndexValue, KeyKind, RecordKey};
pub use kv::{KvConfig, KvError, KvStore, StoreHandle};
pub use offline::{OfflineConfig, OfflineError, OfflineStore, StoreStats, SCHEMA_VERSION};
pub use profile::{ProfileError, ProfileSnapshot, ProfileStore};
pub use queue::{PendingReport, QueueError, ReportQueue, ReportStatus};
pub use sync::{
    NetworkMonitor, NetworkState, ReportUploader, SyncConfig, SyncDriver, SyncError, SyncSummary,
};
