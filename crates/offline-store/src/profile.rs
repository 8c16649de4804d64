//! Profile snapshot store
//!
//! Holds the last known profile of the signed-in user so offline screens have
//! something to show. There is only ever one snapshot and it does not expire.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::collection::{Collection, CollectionSchema, KeyKind, RecordKey};
use crate::kv::{KvError, StoreHandle};

/// Collection holding the profile snapshot
pub const PROFILE_COLLECTION: &str = "user-profile";
/// Key of the single snapshot record
pub const PROFILE_SLOT: &str = "current";

/// Profile store error types
#[derive(Debug, Error)]
pub enum ProfileError {
    /// KV store error
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProfileError {
    /// Whether the underlying storage failed
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, ProfileError::Kv(e) if e.is_storage_unavailable())
    }
}

/// Result type for profile operations
pub type Result<T> = std::result::Result<T, ProfileError>;

/// Last known profile plus when it was saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot<P = Value> {
    /// Always [`PROFILE_SLOT`]
    pub id: String,
    /// Profile fields as fetched from the server
    pub profile: P,
    /// When the snapshot was saved
    pub cached_at: DateTime<Utc>,
}

/// Single-slot profile store
#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<StoreHandle>,
}

impl ProfileStore {
    /// Collection declaration for the profile store
    pub fn schema() -> CollectionSchema {
        CollectionSchema::new(PROFILE_COLLECTION, "id", KeyKind::Text)
    }

    /// Create a profile store over a shared store handle
    pub fn new(store: Arc<StoreHandle>) -> Self {
        Self { store }
    }

    async fn collection(&self) -> Result<Collection> {
        Ok(self.store.collection(PROFILE_COLLECTION).await?)
    }

    /// Replace the snapshot with `profile`
    pub async fn save<P>(&self, profile: &P) -> Result<()>
    where
        P: Serialize,
    {
        let snapshot = ProfileSnapshot {
            id: PROFILE_SLOT.to_string(),
            profile,
            cached_at: Utc::now(),
        };
        self.collection()
            .await?
            .put(&RecordKey::from(PROFILE_SLOT), &snapshot)?;
        Ok(())
    }

    /// Load the snapshot, if one was saved
    pub async fn load<P>(&self) -> Result<Option<ProfileSnapshot<P>>>
    where
        P: DeserializeOwned,
    {
        Ok(self.collection().await?.get(&RecordKey::from(PROFILE_SLOT))?)
    }

    /// Delete the snapshot
    pub async fn clear(&self) -> Result<()> {
        self.collection()
            .await?
            .remove(&RecordKey::from(PROFILE_SLOT))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvConfig;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        username: String,
        points: u32,
    }

    fn profiles() -> ProfileStore {
        let handle = StoreHandle::new(KvConfig::in_memory(), vec![ProfileStore::schema()]);
        ProfileStore::new(Arc::new(handle))
    }

    #[tokio::test]
    async fn test_load_before_save() {
        let store = profiles();
        let snapshot: Option<ProfileSnapshot<Profile>> = store.load().await.unwrap();
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_single_slot() {
        let store = profiles();

        store
            .save(&Profile { username: "maria".to_string(), points: 10 })
            .await
            .unwrap();
        store
            .save(&Profile { username: "maria".to_string(), points: 25 })
            .await
            .unwrap();

        let snapshot: ProfileSnapshot<Profile> = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.profile.points, 25);
        assert_eq!(snapshot.id, PROFILE_SLOT);
        assert_eq!(store.collection().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = profiles();
        store
            .save(&serde_json::json!({ "username": "jo" }))
            .await
            .unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();

        let snapshot: Option<ProfileSnapshot> = store.load().await.unwrap();
        assert!(snapshot.is_none());
    }
}
