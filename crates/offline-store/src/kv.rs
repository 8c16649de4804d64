//! Versioned key-value store
//!
//! This module opens the sled database that backs every offline collection,
//! applies additive schema migrations, and hands out [`Collection`] handles.
//! [`StoreHandle`] memoises the open so all components share one store.

use sled::Db;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::collection::{Collection, CollectionSchema};

const META_VERSION: &[u8] = b"__schema_version";
const META_FINGERPRINT: &[u8] = b"__schema_fingerprint";

/// Key-value store error types
#[derive(Debug, Error)]
pub enum KvError {
    /// The store could not be opened or accessed
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored schema is newer than this build understands
    #[error("Schema version mismatch: expected at most {expected}, found {found}")]
    VersionMismatch {
        /// Version this build declares
        expected: u32,
        /// Version found on disk
        found: u32,
    },

    /// Collection was not declared when the store was opened
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Index was not declared on the collection
    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    /// Index cannot be range-scanned
    #[error("Index does not support range scans: {0}")]
    NotRangeIndex(String),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl KvError {
    /// Whether the underlying storage itself failed (as opposed to bad input)
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            KvError::StorageUnavailable(_) | KvError::Database(sled::Error::Io(_))
        )
    }
}

/// Result type for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

fn unavailable(err: sled::Error) -> KvError {
    KvError::StorageUnavailable(err.to_string())
}

/// Key-value store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for immediate flush)
    pub flush_every_ms: Option<u64>,
    /// Schema version the declared collections belong to
    pub schema_version: u32,
    /// Throwaway store removed on drop; `path` is ignored
    pub temporary: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "hazard_offline.db".to_string(),
            cache_capacity: 16 * 1024 * 1024, // 16MB
            use_compression: true,
            flush_every_ms: Some(500),
            schema_version: 1,
            temporary: false,
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Configuration for a temporary store (tests, ephemeral hosts)
    pub fn in_memory() -> Self {
        Self { temporary: true, ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }

    /// Set the schema version
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }
}

/// Open store with its declared collections
pub struct KvStore {
    db: Db,
    collections: HashMap<String, Collection>,
    schema_version: u32,
}

impl KvStore {
    /// Open (creating if needed) the store and migrate it to `config.schema_version`
    ///
    /// Migrations are additive: missing collections are created and every
    /// secondary index is rebuilt. A store written by a newer schema is refused.
    pub fn open(config: &KvConfig, schemas: &[CollectionSchema]) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression)
            .flush_every_ms(config.flush_every_ms);

        db_config = if config.temporary {
            db_config.temporary(true)
        } else {
            db_config.path(&config.path)
        };

        let db = db_config.open().map_err(unavailable)?;

        let stored = read_version(&db)?;
        if let Some(found) = stored {
            if found > config.schema_version {
                return Err(KvError::VersionMismatch {
                    expected: config.schema_version,
                    found,
                });
            }
        }

        let mut collections = HashMap::with_capacity(schemas.len());
        for schema in schemas {
            let collection = Collection::open(&db, schema.clone()).map_err(|e| match e {
                KvError::Database(err) => unavailable(err),
                other => other,
            })?;
            collections.insert(schema.name.clone(), collection);
        }

        let fingerprint = format!("{:x}", md5::compute(serde_json::to_vec(schemas)?));

        if stored.map_or(true, |version| version < config.schema_version) {
            for collection in collections.values() {
                let indexed = collection.rebuild_indexes()?;
                tracing::debug!("Indexed {} records in {}", indexed, collection.name());
            }

            db.insert(META_VERSION, config.schema_version.to_be_bytes().to_vec())?;
            db.insert(META_FINGERPRINT, fingerprint.as_bytes())?;
            db.flush()?;

            tracing::info!(
                "Migrated offline store schema from version {} to {}",
                stored.unwrap_or(0),
                config.schema_version
            );
        } else {
            let recorded = db.get(META_FINGERPRINT)?;
            if recorded.as_deref() != Some(fingerprint.as_bytes()) {
                tracing::warn!(
                    "Collection declarations changed without a schema version bump (version {})",
                    config.schema_version
                );
            }
        }

        Ok(Self {
            db,
            collections,
            schema_version: config.schema_version,
        })
    }

    /// Open a temporary store (for testing)
    pub fn in_memory(schemas: &[CollectionSchema]) -> Result<Self> {
        Self::open(&KvConfig::in_memory(), schemas)
    }

    /// Get a handle to a declared collection
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.collections
            .get(name)
            .cloned()
            .ok_or_else(|| KvError::UnknownCollection(name.to_string()))
    }

    /// Names of the declared collections
    pub fn collection_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Schema version the store is at
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<usize> {
        Ok(self.db.flush_async().await?)
    }

    /// Approximate on-disk size in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

fn read_version(db: &Db) -> Result<Option<u32>> {
    match db.get(META_VERSION).map_err(unavailable)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes.as_ref().try_into().map_err(|_| {
                KvError::StorageUnavailable("corrupt schema version record".to_string())
            })?;
            Ok(Some(u32::from_be_bytes(raw)))
        }
        None => Ok(None),
    }
}

/// Lazily opened, shared store
///
/// Constructed once by the host and passed to every component. The first
/// caller of [`StoreHandle::open`] opens the store; concurrent callers wait on
/// that same open instead of starting their own. A failed open is not cached,
/// so each caller sees the error and a later call tries again.
pub struct StoreHandle {
    config: KvConfig,
    schemas: Vec<CollectionSchema>,
    store: OnceCell<Arc<KvStore>>,
}

impl StoreHandle {
    /// Create an unopened handle
    pub fn new(config: KvConfig, schemas: Vec<CollectionSchema>) -> Self {
        Self {
            config,
            schemas,
            store: OnceCell::new(),
        }
    }

    /// Open the store, or return the already open one
    pub async fn open(&self) -> Result<Arc<KvStore>> {
        let store = self
            .store
            .get_or_try_init(|| async {
                tracing::debug!("Opening offline store at {}", self.config.path);
                KvStore::open(&self.config, &self.schemas).map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// Open the store and get a collection handle
    pub async fn collection(&self, name: &str) -> Result<Collection> {
        self.open().await?.collection(name)
    }

    /// Whether the store has been opened yet
    pub fn is_open(&self) -> bool {
        self.store.initialized()
    }

    /// Store configuration
    pub fn config(&self) -> &KvConfig {
        &self.config
    }
}
