//! Typed tables, objects and indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::db::{Revision, TableId};
use crate::error::{StateDbError, StateDbResult};
use crate::tracker::DeleteTracker;
use crate::txn::{ReadView, WriteTxn};

/// A value that can be stored in a [`Table`].
pub trait TableObject: Clone + Send + Sync + 'static {
    /// Primary key type. Iteration order of [`Table::all`] follows `Ord`.
    type Key: Ord + Clone + fmt::Debug + Send + Sync + 'static;

    /// Extract the primary key.
    fn primary_key(&self) -> Self::Key;
}

/// An immutable stored object and the revision it was last written at.
pub struct Object<T> {
    revision: Revision,
    data: Arc<T>,
}

impl<T> Object<T> {
    pub(crate) fn new(revision: Revision, data: Arc<T>) -> Self {
        Self { revision, data }
    }

    /// Revision of the transaction that last wrote (or deleted) this object.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Shared pointer to the object data.
    pub fn data(&self) -> &Arc<T> {
        &self.data
    }
}

impl<T> Clone for Object<T> {
    fn clone(&self) -> Self {
        Self {
            revision: self.revision,
            data: self.data.clone(),
        }
    }
}

impl<T> Deref for Object<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("revision", &self.revision)
            .field("data", &self.data)
            .finish()
    }
}

/// Opaque key of a secondary index entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for IndexKey {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

type KeysFn<T> = dyn Fn(&T) -> Vec<IndexKey> + Send + Sync;

/// A non-unique secondary index. One object may produce any number of keys.
pub struct SecondaryIndex<T> {
    name: &'static str,
    keys: Box<KeysFn<T>>,
}

impl<T> SecondaryIndex<T> {
    pub fn new(
        name: &'static str,
        keys: impl Fn(&T) -> Vec<IndexKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            keys: Box::new(keys),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Writer lock of a single table. Held for the lifetime of a [`WriteTxn`]
/// rather than a lexical scope, hence a flag plus condition variable.
#[derive(Default)]
pub(crate) struct TableLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl TableLock {
    pub(crate) fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    pub(crate) fn release(&self) {
        *self.locked.lock() = false;
        self.released.notify_one();
    }
}

/// Type-erased table metadata shared between the database and table handles.
pub struct TableMeta {
    pub(crate) id: TableId,
    pub(crate) name: String,
    pub(crate) lock: TableLock,
    pub(crate) changed: watch::Sender<Revision>,
    /// Delete tracker id → highest revision the tracker has processed.
    pub(crate) trackers: Mutex<BTreeMap<u64, Revision>>,
}

impl TableMeta {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn has_trackers(&self) -> bool {
        !self.trackers.lock().is_empty()
    }

    fn min_tracked(&self) -> Option<Revision> {
        self.trackers.lock().values().copied().min()
    }
}

/// Anything that can be handed to [`crate::Db::write_txn`].
pub trait AnyTable {
    fn meta(&self) -> &Arc<TableMeta>;

    fn table_name(&self) -> &str {
        self.meta().name()
    }
}

/// Published state of a single table.
pub(crate) struct TableRoot<T: TableObject> {
    pub(crate) revision: Revision,
    pub(crate) primary: BTreeMap<T::Key, Object<T>>,
    pub(crate) by_revision: BTreeMap<Revision, BTreeSet<T::Key>>,
    pub(crate) secondary: Vec<BTreeMap<IndexKey, BTreeSet<T::Key>>>,
    pub(crate) graveyard: BTreeMap<Revision, BTreeMap<T::Key, Object<T>>>,
}

impl<T: TableObject> TableRoot<T> {
    pub(crate) fn empty(num_indexes: usize) -> Self {
        Self {
            revision: 0,
            primary: BTreeMap::new(),
            by_revision: BTreeMap::new(),
            secondary: vec![BTreeMap::new(); num_indexes],
            graveyard: BTreeMap::new(),
        }
    }

    /// Drop graveyard entries every tracker has already processed.
    pub(crate) fn gc_graveyard(&mut self, min_tracked: Option<Revision>) {
        match min_tracked {
            None => self.graveyard.clear(),
            Some(low) => self.graveyard = self.graveyard.split_off(&(low + 1)),
        }
    }
}

impl<T: TableObject> Clone for TableRoot<T> {
    fn clone(&self) -> Self {
        Self {
            revision: self.revision,
            primary: self.primary.clone(),
            by_revision: self.by_revision.clone(),
            secondary: self.secondary.clone(),
            graveyard: self.graveyard.clone(),
        }
    }
}

/// Handle to a registered table of `T`.
pub struct Table<T: TableObject> {
    meta: Arc<TableMeta>,
    indexes: Arc<Vec<SecondaryIndex<T>>>,
}

impl<T: TableObject> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            indexes: self.indexes.clone(),
        }
    }
}

impl<T: TableObject> AnyTable for Table<T> {
    fn meta(&self) -> &Arc<TableMeta> {
        &self.meta
    }
}

impl<T: TableObject> Table<T> {
    pub(crate) fn new(meta: Arc<TableMeta>, indexes: Vec<SecondaryIndex<T>>) -> Self {
        Self {
            meta,
            indexes: Arc::new(indexes),
        }
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    fn root<'a>(&self, txn: &'a dyn ReadView) -> Option<&'a TableRoot<T>> {
        txn.table_root(self.meta.id)?.downcast_ref::<TableRoot<T>>()
    }

    fn index_pos(&self, index: &str) -> StateDbResult<usize> {
        self.indexes
            .iter()
            .position(|i| i.name == index)
            .ok_or_else(|| StateDbError::UnknownIndex {
                table: self.name().to_string(),
                index: index.to_string(),
            })
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Revision of the last commit that modified this table.
    pub fn revision(&self, txn: &dyn ReadView) -> Revision {
        self.root(txn).map_or(0, |r| r.revision)
    }

    pub fn num_objects(&self, txn: &dyn ReadView) -> usize {
        self.root(txn).map_or(0, |r| r.primary.len())
    }

    /// Look up an object by primary key.
    pub fn get<'a>(&self, txn: &'a dyn ReadView, key: &T::Key) -> Option<&'a Object<T>> {
        self.root(txn)?.primary.get(key)
    }

    /// Iterate all objects in primary key order.
    pub fn all<'a>(&self, txn: &'a dyn ReadView) -> impl Iterator<Item = &'a Object<T>> + use<'a, T> {
        self.root(txn)
            .into_iter()
            .flat_map(|r| r.primary.values())
    }

    /// Iterate objects with `revision >= from`, in revision order.
    ///
    /// Restarting the scan from `last seen revision + 1` resumes without
    /// revisiting unchanged objects.
    pub fn lower_bound_revision<'a>(
        &self,
        txn: &'a dyn ReadView,
        from: Revision,
    ) -> impl Iterator<Item = &'a Object<T>> + use<'a, T> {
        self.root(txn).into_iter().flat_map(move |r| {
            r.by_revision
                .range(from..)
                .flat_map(|(_, keys)| keys.iter())
                .filter_map(move |key| r.primary.get(key))
        })
    }

    /// All objects whose secondary index `index` contains `key`, in primary
    /// key order.
    pub fn list<'a>(
        &self,
        txn: &'a dyn ReadView,
        index: &str,
        key: &IndexKey,
    ) -> StateDbResult<impl Iterator<Item = &'a Object<T>> + use<'a, T>> {
        let pos = self.index_pos(index)?;
        let root = self.root(txn);
        let keys = root.and_then(|r| r.secondary.get(pos)?.get(key));
        Ok(keys
            .into_iter()
            .flat_map(|set| set.iter())
            .filter_map(move |k| root.and_then(|r| r.primary.get(k))))
    }

    /// Subscribe to the table's committed revision.
    pub fn watch(&self) -> watch::Receiver<Revision> {
        self.meta.changed.subscribe()
    }

    /// Register a delete tracker. Deleted objects are retained until every
    /// registered tracker has marked past their deletion revision.
    pub fn delete_tracker(&self, name: &str) -> DeleteTracker<T> {
        DeleteTracker::register(self.clone(), name)
    }

    // ── Writes ─────────────────────────────────────────────────────

    fn root_mut<'a>(&self, txn: &'a mut WriteTxn) -> StateDbResult<&'a mut TableRoot<T>> {
        let min_tracked = self.meta.min_tracked();
        txn.table_root_mut::<T>(&self.meta, |root| root.gc_graveyard(min_tracked))
    }

    /// Insert or replace an object. Returns the previous object, if any.
    pub fn insert(&self, txn: &mut WriteTxn, data: T) -> StateDbResult<Option<Object<T>>> {
        let revision = txn.revision();
        let indexes = self.indexes.clone();
        let root = self.root_mut(txn)?;
        let key = data.primary_key();
        let object = Object::new(revision, Arc::new(data));

        let old = root.primary.insert(key.clone(), object.clone());
        if let Some(old) = &old {
            remove_index_entry(&mut root.by_revision, &old.revision, &key);
            for (pos, index) in indexes.iter().enumerate() {
                for ik in (index.keys)(old.data.as_ref()) {
                    remove_index_entry(&mut root.secondary[pos], &ik, &key);
                }
            }
        }
        root.by_revision.entry(revision).or_default().insert(key.clone());
        for (pos, index) in indexes.iter().enumerate() {
            for ik in (index.keys)(object.data.as_ref()) {
                root.secondary[pos].entry(ik).or_default().insert(key.clone());
            }
        }
        // A delete earlier in this same transaction is superseded.
        if let Some(buried) = root.graveyard.get_mut(&revision) {
            buried.remove(&key);
            if buried.is_empty() {
                root.graveyard.remove(&revision);
            }
        }
        root.revision = revision;
        txn.mark_dirty(self.meta.id);
        Ok(old)
    }

    /// Insert `data` only if the stored object is still at `expected`.
    pub fn compare_and_swap(
        &self,
        txn: &mut WriteTxn,
        expected: Revision,
        data: T,
    ) -> StateDbResult<Object<T>> {
        let key = data.primary_key();
        let found = self.get(&*txn, &key).map(|o| o.revision);
        if found != Some(expected) {
            return Err(StateDbError::RevisionMismatch {
                table: self.name().to_string(),
                expected,
                found,
            });
        }
        self.insert(txn, data)?;
        self.get(&*txn, &key).cloned().ok_or_else(|| StateDbError::RevisionMismatch {
            table: self.name().to_string(),
            expected,
            found: None,
        })
    }

    /// Delete an object by primary key. Returns the deleted object, if any.
    pub fn delete(&self, txn: &mut WriteTxn, key: &T::Key) -> StateDbResult<Option<Object<T>>> {
        let revision = txn.revision();
        let track = self.meta.has_trackers();
        let indexes = self.indexes.clone();
        let root = self.root_mut(txn)?;

        let Some(old) = root.primary.remove(key) else {
            return Ok(None);
        };
        remove_index_entry(&mut root.by_revision, &old.revision, key);
        for (pos, index) in indexes.iter().enumerate() {
            for ik in (index.keys)(old.data.as_ref()) {
                remove_index_entry(&mut root.secondary[pos], &ik, key);
            }
        }
        if track {
            root.graveyard
                .entry(revision)
                .or_default()
                .insert(key.clone(), Object::new(revision, old.data.clone()));
        }
        root.revision = revision;
        txn.mark_dirty(self.meta.id);
        Ok(Some(old))
    }

    /// Deleted objects with `revision > after`, for delete trackers.
    pub(crate) fn graveyard_after<'a>(
        &self,
        txn: &'a dyn ReadView,
        after: Revision,
    ) -> impl Iterator<Item = &'a Object<T>> + use<'a, T> {
        self.root(txn).into_iter().flat_map(move |r| {
            r.graveyard
                .range(after + 1..)
                .flat_map(|(_, buried)| buried.values())
        })
    }
}

fn remove_index_entry<I: Ord, K: Ord>(index: &mut BTreeMap<I, BTreeSet<K>>, ik: &I, key: &K) {
    if let Some(set) = index.get_mut(ik) {
        set.remove(key);
        if set.is_empty() {
            index.remove(ik);
        }
    }
}
