//! Named collections with secondary indexes
//!
//! A collection is one sled tree holding JSON records keyed by a primary key,
//! plus one tree per secondary index. Every write that touches a record goes
//! through a multi-tree transaction so the record and its index entries never
//! disagree.

use chrono::DateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use sled::{Db, Transactional, Tree};
use std::fmt;
use std::sync::Arc;

use crate::kv::{KvError, Result};

const NUMBER_TAG: u8 = 0x01;
const TEXT_TAG: u8 = 0x02;
const NUMBER_ENTRY_PREFIX: usize = 9;

/// How a collection's primary keys are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    /// Locally generated, monotonically increasing integer ids
    Sequential,
    /// Caller-chosen string keys
    Text,
}

/// Primary key of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Sequential id
    Id(u64),
    /// String key
    Name(String),
}

impl RecordKey {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            RecordKey::Id(id) => id.to_be_bytes().to_vec(),
            RecordKey::Name(name) => name.as_bytes().to_vec(),
        }
    }

    fn from_bytes(kind: KeyKind, bytes: &[u8]) -> Result<Self> {
        match kind {
            KeyKind::Sequential => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| KvError::InvalidKey(format!("{} byte id", bytes.len())))?;
                Ok(RecordKey::Id(u64::from_be_bytes(raw)))
            }
            KeyKind::Text => String::from_utf8(bytes.to_vec())
                .map(RecordKey::Name)
                .map_err(|e| KvError::InvalidKey(e.to_string())),
        }
    }

    fn kind(&self) -> KeyKind {
        match self {
            RecordKey::Id(_) => KeyKind::Sequential,
            RecordKey::Name(_) => KeyKind::Text,
        }
    }

    fn matches_json(&self, value: &Value) -> bool {
        match self {
            RecordKey::Id(id) => value.as_u64() == Some(*id),
            RecordKey::Name(name) => value.as_str() == Some(name.as_str()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => write!(f, "{}", id),
            RecordKey::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<u64> for RecordKey {
    fn from(id: u64) -> Self {
        RecordKey::Id(id)
    }
}

impl From<&str> for RecordKey {
    fn from(name: &str) -> Self {
        RecordKey::Name(name.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(name: String) -> Self {
        RecordKey::Name(name)
    }
}

/// Value type of a secondary index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// JSON string, exact-match lookups only
    Text,
    /// JSON integer, ordered
    Number,
    /// RFC 3339 timestamp string, indexed as epoch milliseconds
    Timestamp,
}

/// A value looked up in (or stored into) a secondary index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    /// Ordered integer (timestamps are stored as epoch millis)
    Number(i64),
    /// Exact-match string
    Text(String),
}

impl IndexValue {
    /// Encode into the byte prefix used by index entries.
    ///
    /// Numbers are sign-flipped big-endian so byte order equals numeric order.
    /// Strings are length-prefixed so one value is never a prefix of another.
    fn encode(&self) -> Vec<u8> {
        match self {
            IndexValue::Number(n) => {
                let mut out = Vec::with_capacity(NUMBER_ENTRY_PREFIX);
                out.push(NUMBER_TAG);
                out.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
                out
            }
            IndexValue::Text(s) => {
                let mut out = Vec::with_capacity(5 + s.len());
                out.push(TEXT_TAG);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
                out
            }
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::Text(s.to_string())
    }
}

impl From<i64> for IndexValue {
    fn from(n: i64) -> Self {
        IndexValue::Number(n)
    }
}

/// Secondary index declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name used by lookups
    pub name: String,
    /// Top-level record field the index reads
    pub field: String,
    /// How the field is interpreted
    pub kind: IndexKind,
}

impl IndexSpec {
    /// Pull this index's value out of a record, if the field is present and well-typed
    pub fn extract(&self, record: &Value) -> Option<IndexValue> {
        let field = record.get(&self.field)?;
        match self.kind {
            IndexKind::Text => field.as_str().map(IndexValue::from),
            IndexKind::Number => field.as_i64().map(IndexValue::Number),
            IndexKind::Timestamp => field
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| IndexValue::Number(t.timestamp_millis())),
        }
    }

    fn entry_key(&self, record: &Value, key: &[u8]) -> Option<Vec<u8>> {
        let mut entry = self.extract(record)?.encode();
        entry.extend_from_slice(key);
        Some(entry)
    }
}

/// Collection declaration: name, primary key and secondary indexes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Collection name (also the sled tree name)
    pub name: String,
    /// Record field that carries the primary key
    pub key_field: String,
    /// Primary key kind
    pub key_kind: KeyKind,
    /// Secondary indexes
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSchema {
    /// Declare a collection without indexes
    pub fn new(name: impl Into<String>, key_field: impl Into<String>, key_kind: KeyKind) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            key_kind,
            indexes: Vec::new(),
        }
    }

    /// Add a secondary index
    pub fn index(mut self, name: impl Into<String>, field: impl Into<String>, kind: IndexKind) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            field: field.into(),
            kind,
        });
        self
    }

    fn index_tree_name(&self, index: &IndexSpec) -> String {
        format!("{}#{}", self.name, index.name)
    }

    fn index_slot(&self, name: &str) -> Result<usize> {
        self.indexes
            .iter()
            .position(|index| index.name == name)
            .ok_or_else(|| KvError::UnknownIndex(format!("{}.{}", self.name, name)))
    }
}

/// Outcome of [`Collection::update`]
#[derive(Debug, Clone, PartialEq)]
pub enum Updated<T> {
    /// No record under the key
    Missing,
    /// The closure declined to change the record
    Unchanged(T),
    /// The changed record was written
    Written(T),
}

/// Handle to one collection inside an open store
///
/// Cheap to clone; all clones share the underlying trees.
#[derive(Clone)]
pub struct Collection {
    schema: Arc<CollectionSchema>,
    // [0] is the primary tree, [1..] follow `schema.indexes`
    trees: Arc<[Tree]>,
    db: Db,
}

impl Collection {
    pub(crate) fn open(db: &Db, schema: CollectionSchema) -> Result<Self> {
        let mut trees = Vec::with_capacity(1 + schema.indexes.len());
        trees.push(db.open_tree(schema.name.as_bytes())?);
        for index in &schema.indexes {
            trees.push(db.open_tree(schema.index_tree_name(index).as_bytes())?);
        }

        Ok(Self {
            schema: Arc::new(schema),
            trees: trees.into(),
            db: db.clone(),
        })
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Collection schema
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    fn primary(&self) -> &Tree {
        &self.trees[0]
    }

    fn check_key(&self, key: &RecordKey, record: &Value) -> Result<()> {
        if key.kind() != self.schema.key_kind {
            return Err(KvError::InvalidKey(format!(
                "{} expects {:?} keys, got {}",
                self.schema.name, self.schema.key_kind, key
            )));
        }
        match record.get(&self.schema.key_field) {
            Some(field) if !key.matches_json(field) => Err(KvError::InvalidKey(format!(
                "{}: record field {} = {} does not match key {}",
                self.schema.name, self.schema.key_field, field, key
            ))),
            _ => Ok(()),
        }
    }

    /// Stage a record change (and its index entries) inside a transaction
    fn stage<E: From<KvError>>(
        &self,
        views: &[TransactionalTree],
        key: &[u8],
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> ConflictableTransactionResult<(), E> {
        for (slot, index) in self.schema.indexes.iter().enumerate() {
            let view = &views[slot + 1];
            let before = old.and_then(|record| index.entry_key(record, key));
            let after = new.and_then(|record| index.entry_key(record, key));
            if before == after {
                continue;
            }
            if let Some(entry) = before {
                view.remove(entry)?;
            }
            if let Some(entry) = after {
                view.insert(entry, Vec::<u8>::new())?;
            }
        }

        match new {
            Some(record) => {
                let bytes = serde_json::to_vec(record)
                    .map_err(|e| abort(E::from(KvError::Serialization(e))))?;
                views[0].insert(key, bytes)?;
            }
            None => {
                views[0].remove(key)?;
            }
        }

        Ok(())
    }

    /// Read the current record inside a transaction
    fn read<E: From<KvError>>(
        views: &[TransactionalTree],
        key: &[u8],
    ) -> ConflictableTransactionResult<Option<Value>, E> {
        match views[0].get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| abort(E::from(KvError::Serialization(e)))),
            None => Ok(None),
        }
    }

    /// Get a record by key
    pub fn get<T>(&self, key: &RecordKey) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.primary().get(key.to_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a record, keeping its index entries in step
    pub fn put<T>(&self, key: &RecordKey, record: &T) -> Result<()>
    where
        T: Serialize,
    {
        let record = serde_json::to_value(record)?;
        self.check_key(key, &record)?;
        let key = key.to_bytes();

        let trees: &[Tree] = &self.trees;
        finish(trees.transaction(|views| {
            let old = Self::read::<KvError>(views, &key)?;
            self.stage(views, &key, old.as_ref(), Some(&record))
        }))
    }

    /// Insert a new record under a freshly generated sequential id
    ///
    /// `build` receives the id so the record can carry it in its key field.
    pub fn insert_with_id<T, F>(&self, build: F) -> Result<u64>
    where
        T: Serialize,
        F: FnOnce(u64) -> T,
    {
        if self.schema.key_kind != KeyKind::Sequential {
            return Err(KvError::InvalidKey(format!(
                "{} does not generate ids",
                self.schema.name
            )));
        }

        // sled ids start at zero; keep zero free as a sentinel for callers
        let id = self.db.generate_id()? + 1;
        self.put(&RecordKey::Id(id), &build(id))?;
        Ok(id)
    }

    /// Atomically read, modify and write one record
    ///
    /// `f` returns `Ok(true)` to write the modified record, `Ok(false)` to leave
    /// it untouched, or an error to abort. It may run more than once if the
    /// transaction conflicts, so it must not have outside side effects.
    pub fn update<T, E, F>(&self, key: &RecordKey, f: F) -> std::result::Result<Updated<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<KvError>,
        F: Fn(&mut T) -> std::result::Result<bool, E>,
    {
        let key_bytes = key.to_bytes();

        let trees: &[Tree] = &self.trees;
        finish(trees.transaction(|views| {
            let Some(old) = Self::read::<E>(views, &key_bytes)? else {
                return Ok(Updated::Missing);
            };
            let mut current: T = serde_json::from_value(old.clone())
                .map_err(|e| abort(E::from(KvError::Serialization(e))))?;

            if !f(&mut current).map_err(ConflictableTransactionError::Abort)? {
                return Ok(Updated::Unchanged(current));
            }

            let new = serde_json::to_value(&current)
                .map_err(|e| abort(E::from(KvError::Serialization(e))))?;
            self.check_key(key, &new).map_err(|e| abort(E::from(e)))?;
            self.stage(views, &key_bytes, Some(&old), Some(&new))?;
            Ok(Updated::Written(current))
        }))
    }

    /// Delete a record; returns whether one existed
    pub fn remove(&self, key: &RecordKey) -> Result<bool> {
        self.remove_if(key, |_: &Value| true)
    }

    /// Delete a record only if it still satisfies `predicate`
    ///
    /// The check and the delete happen in one transaction, so a record rewritten
    /// between a scan and this call is judged on its current contents.
    pub fn remove_if<T, P>(&self, key: &RecordKey, predicate: P) -> Result<bool>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        let key = key.to_bytes();

        let trees: &[Tree] = &self.trees;
        finish(trees.transaction(|views| {
            let Some(old) = Self::read::<KvError>(views, &key)? else {
                return Ok(false);
            };
            let current: T = serde_json::from_value(old.clone())
                .map_err(|e| abort(KvError::Serialization(e)))?;
            if !predicate(&current) {
                return Ok(false);
            }
            self.stage::<KvError>(views, &key, Some(&old), None)?;
            Ok(true)
        }))
    }

    /// Keys whose index value equals `value`
    pub fn keys_by_index(&self, index: &str, value: &IndexValue) -> Result<Vec<RecordKey>> {
        let slot = self.schema.index_slot(index)?;
        let prefix = value.encode();

        let mut keys = Vec::new();
        for item in self.trees[slot + 1].scan_prefix(&prefix) {
            let (entry, _) = item?;
            keys.push(RecordKey::from_bytes(self.schema.key_kind, &entry[prefix.len()..])?);
        }
        Ok(keys)
    }

    /// Records whose index value equals `value`
    ///
    /// Each record is re-checked after the fetch; one that changed since the
    /// index scan is skipped.
    pub fn find_by_index<T>(&self, index: &str, value: &IndexValue) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let declared = &self.schema.indexes[self.schema.index_slot(index)?];

        let mut records = Vec::new();
        for key in self.keys_by_index(index, value)? {
            let Some(record) = self.get::<Value>(&key)? else {
                continue;
            };
            if declared.extract(&record).as_ref() == Some(value) {
                records.push(serde_json::from_value(record)?);
            }
        }
        Ok(records)
    }

    /// Number of index entries equal to `value`, without reading the records
    pub fn count_by_index(&self, index: &str, value: &IndexValue) -> Result<usize> {
        let slot = self.schema.index_slot(index)?;
        let mut count = 0;
        for item in self.trees[slot + 1].scan_prefix(value.encode()) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Keys whose numeric index value is `<= bound`, in ascending index order
    pub fn keys_up_to(&self, index: &str, bound: i64) -> Result<Vec<RecordKey>> {
        let slot = self.schema.index_slot(index)?;
        if self.schema.indexes[slot].kind == IndexKind::Text {
            return Err(KvError::NotRangeIndex(format!("{}.{}", self.schema.name, index)));
        }

        let upper = IndexValue::Number(bound.saturating_add(1)).encode();
        let mut keys = Vec::new();
        for item in self.trees[slot + 1].range(..upper) {
            let (entry, _) = item?;
            keys.push(RecordKey::from_bytes(
                self.schema.key_kind,
                &entry[NUMBER_ENTRY_PREFIX..],
            )?);
        }
        Ok(keys)
    }

    /// All records in key order
    pub fn values<T>(&self) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut records = Vec::new();
        for item in self.primary().iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.primary().len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.primary().is_empty()
    }

    /// Delete every record and its index entries; returns how many were deleted
    ///
    /// Records are removed one transaction at a time from a snapshot of the
    /// keys, so a record written concurrently is either removed whole or kept
    /// whole, never left without its index entries.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for item in self.primary().iter().keys() {
            let key = item?;
            let trees: &[Tree] = &self.trees;
            let existed = finish(trees.transaction(|views| {
                let Some(old) = Self::read::<KvError>(views, &key)? else {
                    return Ok(false);
                };
                self.stage::<KvError>(views, &key, Some(&old), None)?;
                Ok(true)
            }))?;
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Wait until every write made so far is on disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Drop and repopulate every secondary index from the primary tree
    ///
    /// Returns the number of records indexed.
    pub(crate) fn rebuild_indexes(&self) -> Result<usize> {
        for tree in &self.trees[1..] {
            tree.clear()?;
        }

        let mut count = 0;
        for item in self.primary().iter() {
            let (key, bytes) = item?;
            let record: Value = serde_json::from_slice(&bytes)?;
            for (slot, index) in self.schema.indexes.iter().enumerate() {
                if let Some(entry) = index.entry_key(&record, &key) {
                    self.trees[slot + 1].insert(entry, Vec::<u8>::new())?;
                }
            }
            count += 1;
        }
        Ok(count)
    }
}

fn abort<E>(error: E) -> ConflictableTransactionError<E> {
    ConflictableTransactionError::Abort(error)
}

fn finish<T, E: From<KvError>>(result: TransactionResult<T, E>) -> std::result::Result<T, E> {
    result.map_err(|err| match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => E::from(KvError::Database(e)),
    })
}
