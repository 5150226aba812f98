//! The reconciliation loop.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use warplb_statedb::{Db, DeleteTracker, Object, ReadTxn, StateDbError, Table, TableObject};

use crate::retry::{Backoff, RetryOp, RetryQueue};
use crate::status::Status;

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Delay before the first retry of a failed object.
    pub retry_backoff_min: Duration,
    /// Upper bound of the doubling retry delay.
    pub retry_backoff_max: Duration,
    /// How often [`Operations::prune`] runs after the first round.
    pub prune_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_backoff_min: Duration::from_millis(50),
            retry_backoff_max: Duration::from_secs(60),
            prune_interval: Duration::from_secs(300),
        }
    }
}

/// A table object that carries a reconciliation [`Status`].
pub trait Reconcilable: TableObject {
    fn status(&self) -> &Status;

    fn set_status(&mut self, status: Status);
}

/// Applies desired state to the target system.
///
/// Called from a single reconciler task, so implementations own their
/// state without locking. `txn` is the snapshot the object was read from.
pub trait Operations<T>: Send {
    type Error: fmt::Display;

    /// Make the target reflect `object`.
    fn update(&mut self, txn: &ReadTxn, object: &T) -> Result<(), Self::Error>;

    /// Remove everything `object` put into the target. Called once the row
    /// has been deleted from the table.
    fn delete(&mut self, txn: &ReadTxn, object: &T) -> Result<(), Self::Error>;

    /// Remove target state that no object in `objects` accounts for.
    fn prune(
        &mut self,
        txn: &ReadTxn,
        objects: &mut dyn Iterator<Item = &T>,
    ) -> Result<(), Self::Error>;

    /// Whether a failed operation may succeed when tried again later.
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }
}

/// Counters for one reconciliation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Changes that needed no work (status writes, superseded retries).
    pub skipped: usize,
}

impl RoundStats {
    fn merge(&mut self, other: RoundStats) {
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

struct Failure {
    reason: String,
    retryable: bool,
}

/// Result of an `update` call, waiting to be written back as a status.
struct Outcome<T> {
    object: Object<T>,
    attempts: u32,
    result: Result<(), Failure>,
}

/// Drives the objects of one table through their [`Operations`].
///
/// Changes are processed in revision order. Objects that are not
/// [`Status::is_pending`] are skipped, which covers the reconciler's own
/// status writes as well as rows that are already done.
pub struct Reconciler<T: Reconcilable, O: Operations<T>> {
    db: Db,
    table: Table<T>,
    ops: O,
    config: Config,
    tracker: DeleteTracker<T>,
    retries: RetryQueue<T::Key, T>,
    next_prune: Option<Instant>,
}

impl<T: Reconcilable, O: Operations<T>> Reconciler<T, O> {
    pub fn new(db: Db, table: Table<T>, ops: O, config: Config) -> Self {
        let tracker = table.delete_tracker("reconciler");
        let retries = RetryQueue::new(Backoff {
            min: config.retry_backoff_min,
            max: config.retry_backoff_max,
        });
        Self {
            db,
            table,
            ops,
            config,
            tracker,
            retries,
            next_prune: None,
        }
    }

    pub fn operations(&self) -> &O {
        &self.ops
    }

    pub fn operations_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    pub fn into_operations(self) -> O {
        self.ops
    }

    /// Number of objects waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Earliest time [`Self::step`] has timer-driven work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.retries.next_deadline(), self.next_prune) {
            (Some(retry), Some(prune)) => Some(retry.min(prune)),
            (retry, prune) => retry.or(prune),
        }
    }

    /// Process every change committed since the last call.
    pub fn reconcile_changes(&mut self) -> RoundStats {
        let mut stats = RoundStats::default();
        let snap = self.db.read_txn();
        let changes = self.tracker.changes(&snap);
        let Some(last) = changes.last().map(|c| c.revision()) else {
            return stats;
        };

        let now = Instant::now();
        let mut outcomes = Vec::new();
        for change in changes {
            let key = change.object.primary_key();
            if change.deleted {
                self.delete_object(&snap, key, change.object, 0, now, &mut stats);
                continue;
            }
            if !change.object.status().is_pending() {
                stats.skipped += 1;
                continue;
            }
            let attempts = self.retries.attempts(&key) + 1;
            let result = self.update_object(&snap, &change.object);
            outcomes.push(Outcome {
                object: change.object,
                attempts,
                result,
            });
        }
        self.tracker.mark(last);

        self.write_statuses(outcomes, now, &mut stats);
        stats
    }

    /// Retry failed objects whose backoff has elapsed by `now`.
    ///
    /// A retry only runs if the row is still at the revision that failed;
    /// a newer revision has already been handed to `update` by
    /// [`Self::reconcile_changes`].
    pub fn process_retries(&mut self, now: Instant) -> RoundStats {
        let mut stats = RoundStats::default();
        let due = self.retries.take_due(now);
        if due.is_empty() {
            return stats;
        }

        let snap = self.db.read_txn();
        let mut outcomes = Vec::new();
        for (key, entry) in due {
            let current = self.table.get(&snap, &key).cloned();
            match (entry.op, current) {
                (RetryOp::Update { revision }, Some(current)) if current.revision() == revision => {
                    let result = self.update_object(&snap, &current);
                    outcomes.push(Outcome {
                        object: current,
                        attempts: entry.attempts + 1,
                        result,
                    });
                }
                (RetryOp::Delete { object }, None) => {
                    self.delete_object(&snap, key, object, entry.attempts, now, &mut stats);
                }
                // A recreated row drops a pending delete: `update` of the new
                // row must reconcile away whatever the old one left behind.
                _ => {
                    debug!(table = self.table.name(), ?key, "retry superseded by newer revision");
                    stats.skipped += 1;
                }
            }
        }

        self.write_statuses(outcomes, now, &mut stats);
        stats
    }

    /// Run [`Operations::prune`] against the current table contents.
    pub fn prune(&mut self) -> bool {
        let snap = self.db.read_txn();
        let mut objects = self.table.all(&snap).map(|o| o.data().as_ref());
        let result = self.ops.prune(&snap, &mut objects);
        let now = Instant::now();
        match result {
            Ok(()) => {
                info!(table = self.table.name(), "prune completed");
                self.next_prune = Some(now + self.config.prune_interval);
                true
            }
            Err(e) => {
                warn!(table = self.table.name(), error = %e, "prune failed, will retry");
                self.next_prune = Some(now + self.config.retry_backoff_min);
                false
            }
        }
    }

    /// One round: new changes, due retries, then prune if due. The first
    /// round always prunes.
    pub fn step(&mut self, now: Instant) -> RoundStats {
        let mut stats = self.reconcile_changes();
        stats.merge(self.process_retries(now));
        if self.next_prune.is_none_or(|at| at <= now) {
            self.prune();
        }
        stats
    }

    /// Reconcile until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Wakes on commits to the table, on the earliest retry or prune
    /// deadline, and on shutdown. A step in progress always finishes.
    /// Returns the reconciler so callers can inspect the operations.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut changed = self.table.watch();
        info!(table = self.table.name(), "reconciler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.step(Instant::now());

            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.config.prune_interval);

            tokio::select! {
                res = changed.changed() => {
                    if res.is_err() {
                        debug!(table = self.table.name(), "table watch closed");
                        break;
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                _ = shutdown.changed() => {
                    debug!(table = self.table.name(), "reconciler shutting down");
                    break;
                }
            }
        }

        info!(table = self.table.name(), "reconciler stopped");
        self
    }

    fn update_object(&mut self, snap: &ReadTxn, object: &Object<T>) -> Result<(), Failure> {
        self.ops.update(snap, object).map_err(|e| Failure {
            retryable: self.ops.is_retryable(&e),
            reason: e.to_string(),
        })
    }

    fn delete_object(
        &mut self,
        snap: &ReadTxn,
        key: T::Key,
        object: Object<T>,
        attempts: u32,
        now: Instant,
        stats: &mut RoundStats,
    ) {
        match self.ops.delete(snap, &object) {
            Ok(()) => {
                debug!(table = self.table.name(), ?key, "object deleted");
                self.retries.clear(&key);
                stats.deleted += 1;
            }
            Err(e) if self.ops.is_retryable(&e) => {
                stats.failed += 1;
                let attempts = attempts.max(self.retries.attempts(&key)) + 1;
                let delay = self
                    .retries
                    .schedule(key.clone(), RetryOp::Delete { object }, attempts, now);
                warn!(table = self.table.name(), ?key, error = %e, ?delay, "delete failed, will retry");
            }
            Err(e) => {
                stats.failed += 1;
                self.retries.clear(&key);
                error!(table = self.table.name(), ?key, error = %e, "delete failed permanently");
            }
        }
    }

    /// Write the outcome of each update back as the object's status.
    ///
    /// Uses compare-and-swap on the revision the object was read at: if the
    /// row changed meanwhile its new revision is pending and takes
    /// precedence, so the outcome is dropped.
    fn write_statuses(&mut self, outcomes: Vec<Outcome<T>>, now: Instant, stats: &mut RoundStats) {
        if outcomes.is_empty() {
            return;
        }

        let mut txn = self.db.write_txn(&[&self.table]);
        for outcome in outcomes {
            let key = outcome.object.primary_key();
            let status = match &outcome.result {
                Ok(()) => {
                    stats.updated += 1;
                    Status::done()
                }
                Err(failure) if failure.retryable => {
                    stats.failed += 1;
                    let delay = self.retries.delay(outcome.attempts);
                    warn!(
                        table = self.table.name(),
                        ?key,
                        error = %failure.reason,
                        ?delay,
                        "update failed, will retry"
                    );
                    Status::error(failure.reason.clone(), Some(SystemTime::now() + delay))
                }
                Err(failure) => {
                    stats.failed += 1;
                    error!(
                        table = self.table.name(),
                        ?key,
                        error = %failure.reason,
                        "update failed permanently"
                    );
                    Status::error(failure.reason.clone(), None)
                }
            };

            let mut updated = T::clone(&outcome.object);
            updated.set_status(status);
            match self
                .table
                .compare_and_swap(&mut txn, outcome.object.revision(), updated)
            {
                Ok(written) => match &outcome.result {
                    Err(failure) if failure.retryable => {
                        self.retries.schedule(
                            key,
                            RetryOp::Update {
                                revision: written.revision(),
                            },
                            outcome.attempts,
                            now,
                        );
                    }
                    _ => self.retries.clear(&key),
                },
                Err(StateDbError::RevisionMismatch { .. }) => {
                    debug!(table = self.table.name(), ?key, "object changed during update, status dropped");
                }
                Err(e) => {
                    warn!(table = self.table.name(), ?key, error = %e, "failed to write status");
                }
            }
        }

        if txn.is_dirty() {
            txn.commit();
        }
    }
}
