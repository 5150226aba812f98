//! Reconciler behaviour against an in-memory target.

use std::collections::BTreeMap;
use std::sync::Once;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use warplb_reconciler::*;
use warplb_statedb::{Db, ReadTxn, Table, TableObject};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

#[derive(Debug, Clone)]
struct Item {
    name: String,
    value: u32,
    status: Status,
}

impl TableObject for Item {
    type Key = String;

    fn primary_key(&self) -> String {
        self.name.clone()
    }
}

impl Reconcilable for Item {
    fn status(&self) -> &Status {
        &self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }
}

/// Target that records applied values and fails on demand.
#[derive(Default)]
struct FakeOps {
    applied: BTreeMap<String, u32>,
    fail_next: usize,
    fail_permanently: bool,
    updates: usize,
    deletes: usize,
    prunes: usize,
}

impl FakeOps {
    fn check_failure(&mut self) -> Result<(), String> {
        if self.fail_permanently {
            return Err("permanent: bad object".to_string());
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err("injected failure".to_string());
        }
        Ok(())
    }
}

impl Operations<Item> for FakeOps {
    type Error = String;

    fn update(&mut self, _txn: &ReadTxn, object: &Item) -> Result<(), String> {
        self.updates += 1;
        self.check_failure()?;
        self.applied.insert(object.name.clone(), object.value);
        Ok(())
    }

    fn delete(&mut self, _txn: &ReadTxn, object: &Item) -> Result<(), String> {
        self.deletes += 1;
        self.check_failure()?;
        self.applied.remove(&object.name);
        Ok(())
    }

    fn prune(
        &mut self,
        _txn: &ReadTxn,
        objects: &mut dyn Iterator<Item = &Item>,
    ) -> Result<(), String> {
        self.prunes += 1;
        let live: Vec<String> = objects.map(|o| o.name.clone()).collect();
        self.applied.retain(|name, _| live.contains(name));
        Ok(())
    }

    fn is_retryable(&self, error: &String) -> bool {
        !error.starts_with("permanent")
    }
}

fn config() -> Config {
    Config {
        retry_backoff_min: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(10),
        prune_interval: Duration::from_secs(60),
    }
}

fn setup() -> (Db, Table<Item>, Reconciler<Item, FakeOps>) {
    init_tracing();
    let db = Db::new();
    let table = db.new_table::<Item>("items", vec![]).unwrap();
    let reconciler = Reconciler::new(db.clone(), table.clone(), FakeOps::default(), config());
    (db, table, reconciler)
}

fn upsert(db: &Db, table: &Table<Item>, name: &str, value: u32) {
    let mut txn = db.write_txn(&[table]);
    table
        .insert(
            &mut txn,
            Item {
                name: name.to_string(),
                value,
                status: Status::pending(),
            },
        )
        .unwrap();
    txn.commit();
}

fn remove(db: &Db, table: &Table<Item>, name: &str) {
    let mut txn = db.write_txn(&[table]);
    table.delete(&mut txn, &name.to_string()).unwrap();
    txn.commit();
}

fn status_of(db: &Db, table: &Table<Item>, name: &str) -> Status {
    table
        .get(&db.read_txn(), &name.to_string())
        .unwrap()
        .status
        .clone()
}

// ── Updates ────────────────────────────────────────────────────────

#[test]
fn pending_object_becomes_done() {
    let (db, table, mut reconciler) = setup();
    upsert(&db, &table, "a", 1);
    upsert(&db, &table, "b", 2);

    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.updated, 2);
    assert_eq!(stats.failed, 0);
    assert!(status_of(&db, &table, "a").is_done());
    assert_eq!(reconciler.operations().applied.get("b"), Some(&2));

    // The status writes are observed but need no work.
    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.skipped, 2);
    assert_eq!(reconciler.operations().updates, 2);
}

#[test]
fn changed_object_is_updated_again() {
    let (db, table, mut reconciler) = setup();
    upsert(&db, &table, "a", 1);
    reconciler.reconcile_changes();

    upsert(&db, &table, "a", 7);
    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.updated, 1);
    assert_eq!(reconciler.operations().applied.get("a"), Some(&7));
}

// ── Failures and retries ───────────────────────────────────────────

#[test]
fn failure_records_error_and_retries() {
    let (db, table, mut reconciler) = setup();
    reconciler.operations_mut().fail_next = 1;
    upsert(&db, &table, "a", 1);

    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.failed, 1);
    let status = status_of(&db, &table, "a");
    assert_eq!(status.kind, StatusKind::Error);
    assert_eq!(status.error.as_deref(), Some("injected failure"));
    assert!(status.retry_at.is_some());
    assert_eq!(reconciler.pending_retries(), 1);

    // Not due yet.
    let stats = reconciler.process_retries(Instant::now() - Duration::from_secs(1));
    assert_eq!(stats, RoundStats::default());

    let stats = reconciler.process_retries(Instant::now() + Duration::from_secs(1));
    assert_eq!(stats.updated, 1);
    assert!(status_of(&db, &table, "a").is_done());
    assert_eq!(reconciler.pending_retries(), 0);
}

#[test]
fn newer_revision_supersedes_queued_retry() {
    let (db, table, mut reconciler) = setup();
    reconciler.operations_mut().fail_next = 1;
    upsert(&db, &table, "a", 1);
    reconciler.reconcile_changes();
    assert_eq!(reconciler.pending_retries(), 1);

    upsert(&db, &table, "a", 2);

    let stats = reconciler.process_retries(Instant::now() + Duration::from_secs(1));
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.updated, 0);

    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.updated, 1);
    assert_eq!(reconciler.operations().applied.get("a"), Some(&2));
    assert_eq!(reconciler.pending_retries(), 0);
}

#[test]
fn non_retryable_failure_is_not_retried() {
    let (db, table, mut reconciler) = setup();
    reconciler.operations_mut().fail_permanently = true;
    upsert(&db, &table, "a", 1);

    reconciler.reconcile_changes();
    let status = status_of(&db, &table, "a");
    assert_eq!(status.kind, StatusKind::Error);
    assert!(status.retry_at.is_none());
    assert_eq!(reconciler.pending_retries(), 0);
}

// ── Deletions ──────────────────────────────────────────────────────

#[test]
fn deleted_object_is_deleted_once() {
    let (db, table, mut reconciler) = setup();
    upsert(&db, &table, "a", 1);
    reconciler.reconcile_changes();

    remove(&db, &table, "a");
    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.deleted, 1);
    assert!(reconciler.operations().applied.is_empty());

    reconciler.reconcile_changes();
    assert_eq!(reconciler.operations().deletes, 1);
}

#[test]
fn failed_delete_is_retried() {
    let (db, table, mut reconciler) = setup();
    upsert(&db, &table, "a", 1);
    reconciler.reconcile_changes();

    reconciler.operations_mut().fail_next = 1;
    remove(&db, &table, "a");
    let stats = reconciler.reconcile_changes();
    assert_eq!(stats.failed, 1);
    assert_eq!(reconciler.pending_retries(), 1);

    let stats = reconciler.process_retries(Instant::now() + Duration::from_secs(1));
    assert_eq!(stats.deleted, 1);
    assert!(reconciler.operations().applied.is_empty());
}

// ── Prune ──────────────────────────────────────────────────────────

#[test]
fn first_step_prunes_stale_state() {
    let (db, table, mut reconciler) = setup();
    reconciler
        .operations_mut()
        .applied
        .insert("stale".to_string(), 9);
    upsert(&db, &table, "a", 1);

    reconciler.step(Instant::now());
    assert_eq!(reconciler.operations().prunes, 1);
    assert_eq!(
        reconciler.operations().applied.keys().collect::<Vec<_>>(),
        vec!["a"]
    );

    // Next prune waits for the interval.
    reconciler.step(Instant::now());
    assert_eq!(reconciler.operations().prunes, 1);
}

// ── Run loop ───────────────────────────────────────────────────────

async fn wait_for_done(db: &Db, table: &Table<Item>, name: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let done = table
            .get(&db.read_txn(), &name.to_string())
            .is_some_and(|o| o.status.is_done());
        if done {
            return;
        }
        assert!(Instant::now() < deadline, "{name} never reconciled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn run_reconciles_until_shutdown() {
    let (db, table, mut reconciler) = setup();
    reconciler.operations_mut().fail_next = 2;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(reconciler.run(shutdown_rx));

    upsert(&db, &table, "a", 1);
    wait_for_done(&db, &table, "a").await;

    upsert(&db, &table, "b", 2);
    wait_for_done(&db, &table, "b").await;

    shutdown_tx.send(true).unwrap();
    let reconciler = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let ops = reconciler.into_operations();
    assert_eq!(ops.applied.get("a"), Some(&1));
    assert_eq!(ops.applied.get("b"), Some(&2));
    assert!(ops.updates >= 4);
}
