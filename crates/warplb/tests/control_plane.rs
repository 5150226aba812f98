//! End-to-end: config file, event-driven writer and the background
//! reconciler.

mod common;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::sync::{mpsc, oneshot, watch};
use warplb::*;
use warplb_statedb::Db;

const CONFIG: &str = r#"
[reconciler]
retry_backoff_min = "10ms"
retry_backoff_max = "100ms"
prune_interval = "1m"

[loadbalancer]
node_name = "node-a"
node_port_min = 31000
"#;

#[test]
fn config_file_is_loaded_and_validated() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = LbConfig::from_file(file.path()).unwrap();
    assert_eq!(config.retry_backoff_min(), Duration::from_millis(10));
    assert_eq!(config.retry_backoff_max(), Duration::from_millis(100));
    assert_eq!(config.prune_interval(), Duration::from_secs(60));
    assert_eq!(config.map_timeout(), Duration::from_secs(1));
    assert_eq!(config.loadbalancer.node_name, "node-a");
    assert_eq!(config.loadbalancer.node_port_min, 31000);
    assert_eq!(config.loadbalancer.node_port_max, 32767);

    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[loadbalancer]\nmax_services = 70000\n").unwrap();
    let err = LbConfig::from_file(&bad).unwrap_err();
    assert!(format!("{err:#}").contains("max_services"), "{err:#}");

    assert!(LbConfig::from_file(&dir.path().join("missing.toml")).is_err());
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_flow_through_to_the_maps() {
    init_tracing();
    let config = LbConfig::from_toml_str(CONFIG).unwrap();
    let maps = Arc::new(MemoryLbMaps::new());
    let faulty = Arc::new(FaultyLbMaps::new(maps.clone()));
    let (writer, reconciler) = new_control_plane(Db::new(), &config, faulty.clone()).unwrap();
    let writer = Arc::new(writer);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = spawn_reconciler(reconciler, shutdown_rx.clone());
    let (events_tx, events_rx) = mpsc::channel(16);
    let events = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run_events(events_rx, shutdown_rx).await })
    };

    // The first map write fails; the retry brings the frontend to Done.
    faulty.fail_next(1);
    let web = ServiceName::new("default", "web");
    let fe = addr("10.0.0.1:80/TCP");
    let (done_tx, done_rx) = oneshot::channel();
    let sync = ServiceSync {
        service: writer.new_service(web.clone(), "k8s"),
        frontends: vec![frontend_params(&web, fe, SvcType::ClusterIP)],
        backends: vec![
            BackendParams::new(addr("10.1.0.1:80/TCP")),
            BackendParams::new(addr("10.1.0.2:80/TCP")),
        ],
    };
    events_tx
        .send(
            Event::upsert(web.clone(), sync)
                .with_done(move |err| {
                    let _ = done_tx.send(err.map(ToString::to_string));
                }),
        )
        .await
        .unwrap();
    assert_eq!(done_rx.await.unwrap(), None);

    let is_done = |writer: &Writer| {
        let txn = writer.read_txn();
        writer
            .frontends()
            .get(&txn, &fe)
            .is_some_and(|o| o.status.is_done())
    };
    wait_until(|| is_done(&writer)).await;
    let lines = dump::dump_lb_maps(maps.as_ref(), true).unwrap();
    assert!(
        masters(&lines)[0].contains(" COUNT=2 "),
        "{lines:#?}"
    );

    // A rejected event is reported and the loop keeps going.
    let (done_tx, done_rx) = oneshot::channel();
    let mismatched = ServiceSync {
        service: writer.new_service(ServiceName::new("default", "other"), "k8s"),
        frontends: Vec::new(),
        backends: Vec::new(),
    };
    events_tx
        .send(
            Event::upsert(web.clone(), mismatched)
                .with_done(move |err| {
                    let _ = done_tx.send(err.map(ToString::to_string));
                }),
        )
        .await
        .unwrap();
    let rejected = done_rx.await.unwrap().expect("mismatched event rejected");
    assert!(rejected.contains("does not match"), "{rejected}");

    events_tx.send(Event::delete(web.clone())).await.unwrap();
    wait_until(|| maps.is_empty()).await;

    shutdown_tx.send(true).unwrap();
    events.await.unwrap();
    let reconciler = reconciler.await.unwrap();
    assert!(reconciler.operations().is_idle());
    assert_eq!(reconciler.pending_retries(), 0);
}
