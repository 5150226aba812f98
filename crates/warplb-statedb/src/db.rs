//! Database handle: table registry, root pointer and revision clock.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StateDbError, StateDbResult};
use crate::table::{AnyTable, SecondaryIndex, Table, TableLock, TableMeta, TableObject, TableRoot};
use crate::txn::{ReadTxn, WriteTxn};

/// Store-wide monotonically increasing commit counter.
pub type Revision = u64;

pub(crate) type TableId = usize;

/// The published state of every table, indexed by table id.
pub(crate) type RootVec = Vec<Arc<dyn Any + Send + Sync>>;

pub(crate) struct DbInner {
    pub(crate) root: RwLock<Arc<RootVec>>,
    pub(crate) tables: RwLock<Vec<Arc<TableMeta>>>,
    pub(crate) revision: AtomicU64,
}

/// Shared handle to an in-memory table store.
///
/// `Db` is cheap to clone and can be moved into any number of tasks.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    /// Create an empty database with no tables.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DbInner {
                root: RwLock::new(Arc::new(Vec::new())),
                tables: RwLock::new(Vec::new()),
                revision: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new table with the given secondary indexes.
    ///
    /// Table names are unique within a database.
    pub fn new_table<T: TableObject>(
        &self,
        name: &str,
        indexes: Vec<SecondaryIndex<T>>,
    ) -> StateDbResult<Table<T>> {
        let mut tables = self.inner.tables.write();
        if tables.iter().any(|t| t.name() == name) {
            return Err(StateDbError::TableExists(name.to_string()));
        }

        let id = tables.len();
        let (changed, _) = watch::channel(0);
        let meta = Arc::new(TableMeta {
            id,
            name: name.to_string(),
            lock: TableLock::default(),
            changed,
            trackers: Mutex::new(BTreeMap::new()),
        });
        tables.push(meta.clone());

        // Publish an empty root for the table while still holding the
        // registry lock so table ids and root slots stay aligned.
        let mut root = self.inner.root.write();
        let mut next: RootVec = (**root).clone();
        next.push(Arc::new(TableRoot::<T>::empty(indexes.len())));
        *root = Arc::new(next);

        debug!(table = name, id, "table registered");
        Ok(Table::new(meta, indexes))
    }

    /// Take a consistent snapshot of every table.
    pub fn read_txn(&self) -> ReadTxn {
        ReadTxn::new(self.inner.root.read().clone())
    }

    /// Start a write transaction over the given tables.
    ///
    /// Blocks until every table's writer lock is available. Locks are taken
    /// in table-id order so concurrent transactions over overlapping table
    /// sets cannot deadlock; transactions over disjoint sets proceed in
    /// parallel.
    pub fn write_txn(&self, tables: &[&dyn AnyTable]) -> WriteTxn {
        let mut metas: Vec<Arc<TableMeta>> = tables.iter().map(|t| t.meta().clone()).collect();
        metas.sort_by_key(|m| m.id);
        metas.dedup_by_key(|m| m.id);

        for meta in &metas {
            meta.lock.acquire();
        }

        // Allocated after the locks are held: revisions within a table are
        // therefore strictly increasing in commit order.
        let revision = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let base = self.inner.root.read().clone();

        WriteTxn::new(self.inner.clone(), revision, base, metas)
    }

    /// The most recently allocated revision.
    pub fn revision(&self) -> Revision {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Names of all registered tables, in registration order.
    pub fn table_names(&self) -> Vec<String> {
        self.inner
            .tables
            .read()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}
