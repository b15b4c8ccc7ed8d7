// quarry-core/src/catalog.rs
//! Collection and index metadata.
//!
//! ```text
//! Catalog
//!   └── RwLock<Arc<CatalogEpoch>>         swapped whole on every change
//!         └── ns -> Arc<CollectionEntry>  records, gate, Vec<Arc<IndexEntry>>
//! ```
//!
//! Readers clone the current `Arc<CatalogEpoch>` and never observe a
//! half-applied change. Writers serialize on `write_lock`, copy the map,
//! apply their change and publish the result as the next epoch. Flags such
//! as `multikey` only ever change by publishing a new epoch, so a reader
//! that saw `multikey = true` can never later see `false`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::{IndexBuild, IndexDescriptor, IndexTree, ID_INDEX_NAME};
use crate::storage::RecordStore;
use crate::txn::{CollectionGate, Timestamp};
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum IndexState {
    Building(Arc<IndexBuild>),
    /// Usable by plans reading at or after `ready_ts`.
    Ready { ready_ts: Timestamp },
}

pub struct IndexEntry {
    pub descriptor: IndexDescriptor,
    pub tree: Arc<IndexTree>,
    pub state: IndexState,
    pub multikey: bool,
}

impl IndexEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, IndexState::Ready { .. })
    }

    pub fn usable_at(&self, read_ts: Timestamp) -> bool {
        matches!(self.state, IndexState::Ready { ready_ts } if ready_ts <= read_ts)
    }

    pub fn build(&self) -> Option<&Arc<IndexBuild>> {
        match &self.state {
            IndexState::Building(build) => Some(build),
            IndexState::Ready { .. } => None,
        }
    }

    fn with_multikey(&self) -> IndexEntry {
        IndexEntry {
            descriptor: self.descriptor.clone(),
            tree: self.tree.clone(),
            state: self.state.clone(),
            multikey: true,
        }
    }
}

impl std::fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .field("multikey", &self.multikey)
            .finish()
    }
}

#[derive(Clone)]
pub struct CollectionEntry {
    pub ns: String,
    pub uuid: Uuid,
    pub created_ts: Timestamp,
    pub options: Document,
    pub collation: Option<Collation>,
    pub records: Arc<RecordStore>,
    pub gate: Arc<CollectionGate>,
    pub indexes: Vec<Arc<IndexEntry>>,
    /// Bumped whenever the index set changes; cached plans carry it.
    pub index_generation: u64,
}

impl CollectionEntry {
    pub fn new(ns: &str, created_ts: Timestamp, options: Document, collation: Option<Collation>) -> Self {
        let id_index = IndexEntry {
            descriptor: IndexDescriptor::id_index(collation.as_ref()),
            tree: Arc::new(IndexTree::new()),
            state: IndexState::Ready { ready_ts: created_ts },
            multikey: false,
        };
        CollectionEntry {
            ns: ns.to_string(),
            uuid: Uuid::new_v4(),
            created_ts,
            options,
            collation,
            records: Arc::new(RecordStore::new()),
            gate: Arc::new(CollectionGate::new()),
            indexes: vec![Arc::new(id_index)],
            index_generation: 1,
        }
    }

    pub fn db(&self) -> &str {
        self.ns.split_once('.').map(|(db, _)| db).unwrap_or(&self.ns)
    }

    pub fn coll(&self) -> &str {
        self.ns.split_once('.').map(|(_, c)| c).unwrap_or("")
    }

    pub fn visible_at(&self, read_ts: Timestamp) -> bool {
        self.created_ts <= read_ts
    }

    pub fn index(&self, name: &str) -> Option<&Arc<IndexEntry>> {
        self.indexes.iter().find(|i| i.descriptor.name == name)
    }

    pub fn id_index(&self) -> Result<&Arc<IndexEntry>> {
        self.index(ID_INDEX_NAME).ok_or_else(|| {
            QuarryError::new(
                ErrorCode::DataCorruptionDetected,
                format!("collection {} has no _id index", self.ns),
            )
        })
    }

    /// Indexes a plan reading at `read_ts` may use.
    pub fn usable_indexes(&self, read_ts: Timestamp) -> impl Iterator<Item = &Arc<IndexEntry>> {
        self.indexes.iter().filter(move |i| i.usable_at(read_ts))
    }

    pub fn info(&self) -> Document {
        let mut info = Document::new();
        info.insert("name", self.coll());
        info.insert("type", "collection");
        info.insert("options", self.options.clone());
        let mut extra = Document::new();
        extra.insert("uuid", self.uuid.to_string());
        extra.insert("readOnly", false);
        info.insert("info", extra);
        info
    }
}

impl std::fmt::Debug for CollectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionEntry")
            .field("ns", &self.ns)
            .field("created_ts", &self.created_ts)
            .field("indexes", &self.indexes)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CatalogEpoch {
    pub epoch: u64,
    collections: BTreeMap<String, Arc<CollectionEntry>>,
}

impl CatalogEpoch {
    pub fn get(&self, ns: &str) -> Option<&Arc<CollectionEntry>> {
        self.collections.get(ns)
    }

    pub fn collections(&self) -> impl Iterator<Item = &Arc<CollectionEntry>> {
        self.collections.values()
    }

    pub fn in_db<'a>(&'a self, db: &'a str) -> impl Iterator<Item = &'a Arc<CollectionEntry>> + 'a {
        self.collections.values().filter(move |c| c.db() == db)
    }
}

#[derive(Default)]
pub struct Catalog {
    current: RwLock<Arc<CatalogEpoch>>,
    write_lock: Mutex<()>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn snapshot(&self) -> Arc<CatalogEpoch> {
        self.current.read().clone()
    }

    pub fn get(&self, ns: &str) -> Option<Arc<CollectionEntry>> {
        self.current.read().get(ns).cloned()
    }

    /// Apply `change` to a copy of the collection map and publish it as the
    /// next epoch. Nothing is published if `change` fails.
    pub fn modify<F, R>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut BTreeMap<String, Arc<CollectionEntry>>) -> Result<R>,
    {
        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        let mut collections = current.collections.clone();
        let result = change(&mut collections)?;
        *self.current.write() = Arc::new(CatalogEpoch {
            epoch: current.epoch + 1,
            collections,
        });
        Ok(result)
    }

    /// Replace one collection entry through `change`.
    pub fn modify_collection<F, R>(&self, ns: &str, change: F) -> Result<R>
    where
        F: FnOnce(&mut CollectionEntry) -> Result<R>,
    {
        self.modify(|collections| {
            let existing = collections
                .get(ns)
                .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))?;
            let mut entry = (**existing).clone();
            let result = change(&mut entry)?;
            collections.insert(ns.to_string(), Arc::new(entry));
            Ok(result)
        })
    }

    /// Publish the multikey flag for `index`. Must happen before any
    /// multikey key of that index is installed.
    pub fn set_multikey(&self, ns: &str, index: &str) -> Result<()> {
        if let Some(entry) = self.get(ns) {
            if entry.index(index).map(|i| i.multikey).unwrap_or(true) {
                return Ok(());
            }
        }
        self.modify_collection(ns, |entry| {
            if let Some(pos) = entry.indexes.iter().position(|i| i.descriptor.name == index) {
                if !entry.indexes[pos].multikey {
                    let updated = entry.indexes[pos].with_multikey();
                    entry.indexes[pos] = Arc::new(updated);
                }
            }
            Ok(())
        })
    }
}

/// Validate a `db.collection` namespace.
pub fn validate_namespace(ns: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(QuarryError::new(
            ErrorCode::InvalidNamespace,
            format!("invalid namespace '{}': {}", ns, why),
        ))
    };
    let Some((db, coll)) = ns.split_once('.') else {
        return invalid("expected <db>.<collection>");
    };
    if db.is_empty() || coll.is_empty() {
        return invalid("database and collection names must be non-empty");
    }
    if db.contains(|c: char| matches!(c, '/' | '\\' | ' ' | '"' | '$' | '\0')) {
        return invalid("database name contains an invalid character");
    }
    if coll.contains(|c: char| matches!(c, '$' | '\0')) {
        return invalid("collection name contains an invalid character");
    }
    Ok(())
}

/// Parse collection creation options.
pub fn parse_create_options(options: &Document) -> Result<Option<Collation>> {
    let mut collation = None;
    for (key, value) in options.iter() {
        match key.as_str() {
            "collation" => {
                let parsed = Collation::from_value(value)?;
                collation = (!parsed.is_simple()).then_some(parsed);
            }
            "capped" | "size" | "max" | "validator" | "comment" | "writeConcern" => {
                if key == "capped" && value.truthy() {
                    return Err(QuarryError::InvalidOptions("capped collections are not supported".into()));
                }
            }
            other => {
                return Err(QuarryError::new(
                    ErrorCode::UnknownField,
                    format!("unrecognized field '{}' in create options", other),
                ))
            }
        }
    }
    Ok(collation)
}

/// The options document stored with a collection.
pub fn stored_options(collation: Option<&Collation>) -> Document {
    let mut options = Document::new();
    if let Some(c) = collation {
        options.insert("collation", Value::Document(c.to_document()));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_publishes_new_epoch() {
        let catalog = Catalog::new();
        let before = catalog.snapshot();
        catalog
            .modify(|map| {
                map.insert("test.c".into(), Arc::new(CollectionEntry::new("test.c", 1, Document::new(), None)));
                Ok(())
            })
            .unwrap();
        assert!(before.get("test.c").is_none());
        assert!(catalog.get("test.c").is_some());
        assert_eq!(catalog.snapshot().epoch, before.epoch + 1);
    }

    #[test]
    fn test_failed_change_is_not_published() {
        let catalog = Catalog::new();
        let err = catalog
            .modify::<_, ()>(|map| {
                map.insert("test.c".into(), Arc::new(CollectionEntry::new("test.c", 1, Document::new(), None)));
                Err(QuarryError::BadValue("nope".into()))
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
        assert!(catalog.get("test.c").is_none());
    }

    #[test]
    fn test_multikey_is_monotonic_across_epochs() {
        let catalog = Catalog::new();
        catalog
            .modify(|map| {
                map.insert("test.c".into(), Arc::new(CollectionEntry::new("test.c", 1, Document::new(), None)));
                Ok(())
            })
            .unwrap();
        let old = catalog.get("test.c").unwrap();
        catalog.set_multikey("test.c", ID_INDEX_NAME).unwrap();
        assert!(!old.index(ID_INDEX_NAME).unwrap().multikey);
        let new = catalog.get("test.c").unwrap();
        assert!(new.index(ID_INDEX_NAME).unwrap().multikey);
        assert!(Arc::ptr_eq(&old.records, &new.records));
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("test.c").is_ok());
        assert!(validate_namespace("test.a.b").is_ok());
        assert_eq!(validate_namespace("nodot").unwrap_err().code(), ErrorCode::InvalidNamespace);
        assert!(validate_namespace("test.$bad").is_err());
        assert!(validate_namespace(".c").is_err());
    }
}
