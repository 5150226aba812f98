//! warplb-reconciler: drive external state toward the contents of a table.
//!
//! A [`Reconciler`] watches one table of [`Reconcilable`] objects. Every
//! object written with a pending [`Status`] is handed to the table's
//! [`Operations`]; the outcome is written back as `Done` or `Error`.
//! Failed objects are retried with exponential backoff, deletions are
//! observed through a delete tracker, and `prune` periodically removes
//! external state that no row accounts for.
//!
//! # Architecture
//!
//! ```text
//! Reconciler::run
//!   ├── table watch ───────────► reconcile_changes()  (revision order)
//!   │                              ├── deleted  → Operations::delete
//!   │                              └── pending  → Operations::update
//!   ├── earliest retry_at ─────► process_retries()    (same revision only)
//!   ├── prune deadline ────────► prune()
//!   └── shutdown watch ────────► return
//! ```
//!
//! # Retries
//!
//! The delay starts at `retry_backoff_min` and doubles per failed attempt up
//! to `retry_backoff_max`. A retry is discarded when the row has been
//! rewritten since it failed: the new revision is reconciled immediately
//! instead, so fresh desired state never waits behind a stale backoff.

pub mod reconciler;
pub mod retry;
pub mod status;

pub use reconciler::{Config, Operations, Reconcilable, Reconciler, RoundStats};
pub use retry::Backoff;
pub use status::{Status, StatusKind};
