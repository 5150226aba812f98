//! warplb-statedb: in-memory, multi-version table store.
//!
//! Tables hold immutable objects tagged with the revision of the write
//! transaction that last touched them. Readers take a [`ReadTxn`] snapshot
//! (a clone of the database root pointer) and never block writers; writers
//! lock the tables they mutate and publish every change under one revision
//! on [`WriteTxn::commit`].
//!
//! # Architecture
//!
//! ```text
//! Db
//!   ├── root: Arc<[TableRoot<T>; n]>      (swapped on commit)
//!   ├── per-table writer lock              (taken in table-id order)
//!   └── per-table watch channel            (committed revision)
//!
//! TableRoot<T>
//!   ├── primary     key → Object<T>
//!   ├── by_revision (revision, key)
//!   ├── secondary   index key → {key}
//!   └── graveyard   (revision, key) → deleted Object<T>   (only while delete trackers exist)
//! ```

pub mod db;
pub mod error;
pub mod table;
pub mod tracker;
pub mod txn;

pub use db::{Db, Revision};
pub use error::{StateDbError, StateDbResult};
pub use table::{AnyTable, IndexKey, Object, SecondaryIndex, Table, TableMeta, TableObject};
pub use tracker::{Change, DeleteTracker};
pub use txn::{ReadTxn, ReadView, WriteTxn};
