//! Read snapshots and write transactions.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::db::{DbInner, Revision, RootVec, TableId};
use crate::error::{StateDbError, StateDbResult};
use crate::table::{TableMeta, TableObject, TableRoot};

/// Read access to a consistent view of the tables.
///
/// Implemented by [`ReadTxn`] (a committed snapshot) and [`WriteTxn`]
/// (the snapshot plus the transaction's own uncommitted writes).
pub trait ReadView {
    #[doc(hidden)]
    fn table_root(&self, id: usize) -> Option<&(dyn Any + Send + Sync)>;
}

/// An immutable snapshot of all tables.
///
/// Cloning is cheap; a snapshot never observes later commits.
#[derive(Clone)]
pub struct ReadTxn {
    root: Arc<RootVec>,
}

impl ReadTxn {
    pub(crate) fn new(root: Arc<RootVec>) -> Self {
        Self { root }
    }
}

impl ReadView for ReadTxn {
    fn table_root(&self, id: usize) -> Option<&(dyn Any + Send + Sync)> {
        self.root.get(id).map(|r| &**r)
    }
}

/// Exclusive write access to a set of tables.
///
/// All changes become visible atomically on [`WriteTxn::commit`]. Dropping
/// an uncommitted transaction discards its changes and releases the locks.
pub struct WriteTxn {
    db: Arc<DbInner>,
    revision: Revision,
    base: Arc<RootVec>,
    modified: BTreeMap<TableId, Box<dyn Any + Send + Sync>>,
    dirty: BTreeSet<TableId>,
    locked: Vec<Arc<TableMeta>>,
}

impl WriteTxn {
    pub(crate) fn new(
        db: Arc<DbInner>,
        revision: Revision,
        base: Arc<RootVec>,
        locked: Vec<Arc<TableMeta>>,
    ) -> Self {
        Self {
            db,
            revision,
            base,
            modified: BTreeMap::new(),
            dirty: BTreeSet::new(),
            locked,
        }
    }

    /// The revision every object written by this transaction is tagged with.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Whether any table has been changed so far.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub(crate) fn mark_dirty(&mut self, id: TableId) {
        self.dirty.insert(id);
    }

    /// Copy-on-write access to a locked table's root. `on_first` runs once,
    /// when the table is first touched by this transaction.
    ///
    /// That first touch copies the table's index maps, so it costs time
    /// linear in the table size. Object data is behind `Arc` and is not
    /// copied. Further writes in the same transaction update the copied
    /// indexes in place, one key at a time.
    pub(crate) fn table_root_mut<T: TableObject>(
        &mut self,
        meta: &Arc<TableMeta>,
        on_first: impl FnOnce(&mut TableRoot<T>),
    ) -> StateDbResult<&mut TableRoot<T>> {
        if !self.locked.iter().any(|m| Arc::ptr_eq(m, meta)) {
            return Err(StateDbError::TableNotLocked(meta.name().to_string()));
        }

        if !self.modified.contains_key(&meta.id) {
            let mut root = self
                .base
                .get(meta.id)
                .and_then(|r| r.downcast_ref::<TableRoot<T>>())
                .cloned()
                .ok_or_else(|| StateDbError::TableNotRegistered(meta.name().to_string()))?;
            on_first(&mut root);
            self.modified.insert(meta.id, Box::new(root));
        }

        self.modified
            .get_mut(&meta.id)
            .and_then(|r| r.downcast_mut::<TableRoot<T>>())
            .ok_or_else(|| StateDbError::TableNotRegistered(meta.name().to_string()))
    }

    /// Atomically publish every change made in this transaction.
    ///
    /// Returns a snapshot that includes the committed changes.
    pub fn commit(mut self) -> ReadTxn {
        let modified = std::mem::take(&mut self.modified);
        let dirty = std::mem::take(&mut self.dirty);
        if dirty.is_empty() {
            return ReadTxn::new(self.db.root.read().clone());
        }

        let snapshot = {
            let mut root = self.db.root.write();
            let mut next: RootVec = (**root).clone();
            for (id, table_root) in modified {
                if dirty.contains(&id) {
                    next[id] = Arc::from(table_root);
                }
            }
            *root = Arc::new(next);
            root.clone()
        };

        for meta in self.locked.iter().filter(|m| dirty.contains(&m.id)) {
            meta.changed.send_replace(self.revision);
        }

        debug!(revision = self.revision, tables = dirty.len(), "write transaction committed");
        ReadTxn::new(snapshot)
    }

    /// Discard all changes. Equivalent to dropping the transaction.
    pub fn abort(self) {}
}

impl ReadView for WriteTxn {
    fn table_root(&self, id: usize) -> Option<&(dyn Any + Send + Sync)> {
        match self.modified.get(&id) {
            Some(root) => Some(&**root),
            None => self.base.get(id).map(|r| &**r),
        }
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.dirty.is_empty() {
            debug!(revision = self.revision, "write transaction aborted");
        }
        for meta in self.locked.iter().rev() {
            meta.lock.release();
        }
    }
}
