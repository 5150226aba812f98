//! Delete trackers: change feeds that include deletions.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::db::Revision;
use crate::table::{AnyTable, Object, Table, TableObject};
use crate::txn::ReadView;

/// One upsert or deletion observed by a [`DeleteTracker`].
#[derive(Debug)]
pub struct Change<T> {
    pub object: Object<T>,
    pub deleted: bool,
}

impl<T> Change<T> {
    pub fn revision(&self) -> Revision {
        self.object.revision()
    }
}

impl<T> Clone for Change<T> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            deleted: self.deleted,
        }
    }
}

/// A registered consumer of a table's changes.
///
/// While a tracker exists, deleted objects are kept in the table's graveyard
/// until the tracker has marked past their deletion revision. Dropping the
/// tracker unregisters it.
pub struct DeleteTracker<T: TableObject> {
    table: Table<T>,
    id: u64,
    name: String,
    processed: Revision,
}

impl<T: TableObject> DeleteTracker<T> {
    pub(crate) fn register(table: Table<T>, name: &str) -> Self {
        let id = next_tracker_id();
        table.meta().trackers.lock().insert(id, 0);
        debug!(table = table.name(), tracker = name, "delete tracker registered");
        Self {
            table,
            id,
            name: name.to_string(),
            processed: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest revision marked as processed.
    pub fn processed(&self) -> Revision {
        self.processed
    }

    /// Upserts and deletions with revision above [`Self::processed`], in
    /// revision order (ties broken by primary key).
    pub fn changes(&self, txn: &dyn ReadView) -> Vec<Change<T>> {
        let upserted = self
            .table
            .lower_bound_revision(txn, self.processed + 1)
            .map(|object| Change {
                object: object.clone(),
                deleted: false,
            });
        let deleted = self
            .table
            .graveyard_after(txn, self.processed)
            .map(|object| Change {
                object: object.clone(),
                deleted: true,
            });

        let mut changes: Vec<Change<T>> = upserted.chain(deleted).collect();
        changes.sort_by(|a, b| {
            a.revision()
                .cmp(&b.revision())
                .then_with(|| a.object.primary_key().cmp(&b.object.primary_key()))
        });
        changes
    }

    /// Mark every change up to and including `revision` as processed.
    /// Graveyard entries at or below the lowest mark of all trackers are
    /// released by the next write to the table.
    pub fn mark(&mut self, revision: Revision) {
        if revision <= self.processed {
            return;
        }
        self.processed = revision;
        self.table.meta().trackers.lock().insert(self.id, revision);
    }
}

impl<T: TableObject> Drop for DeleteTracker<T> {
    fn drop(&mut self) {
        self.table.meta().trackers.lock().remove(&self.id);
    }
}

fn next_tracker_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
