//! Table and datapath invariants under random writer operations.

mod common;

use std::collections::BTreeSet;

use common::*;
use proptest::prelude::*;
use warplb::*;

#[derive(Debug, Clone)]
enum Op {
    UpsertFrontend { svc: u8, fe: u8, backends: Vec<u8> },
    DeleteFrontend { fe: u8 },
    DeleteBackends { svc: u8, backends: Vec<u8> },
    DeleteService { svc: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    let backends = || proptest::collection::vec(0u8..6, 0..4);
    prop_oneof![
        3 => (0u8..3, 0u8..4, backends())
            .prop_map(|(svc, fe, backends)| Op::UpsertFrontend { svc, fe, backends }),
        1 => (0u8..4).prop_map(|fe| Op::DeleteFrontend { fe }),
        1 => (0u8..3, backends()).prop_map(|(svc, backends)| Op::DeleteBackends { svc, backends }),
        1 => (0u8..3).prop_map(|svc| Op::DeleteService { svc }),
    ]
}

fn service(i: u8) -> ServiceName {
    ServiceName::new("default", format!("svc-{i}"))
}

fn frontend(i: u8) -> L3n4Addr {
    addr(&format!("10.0.0.{}:80/TCP", i + 1))
}

fn backend(i: u8) -> L3n4Addr {
    addr(&format!("10.1.0.{}:80/TCP", i + 1))
}

/// Errors are legitimate outcomes (e.g. address conflicts); the tables
/// must stay consistent either way.
fn apply(f: &Fixture, op: &Op) {
    let _ = match op {
        Op::UpsertFrontend { svc, fe, backends } => {
            let name = service(*svc);
            let backends: Vec<BackendParams> =
                backends.iter().map(|b| BackendParams::new(backend(*b))).collect();
            f.writer
                .upsert_service(f.writer.new_service(name.clone(), "test"))
                .and_then(|()| {
                    f.writer.upsert_frontend(
                        frontend_params(&name, frontend(*fe), SvcType::ClusterIP),
                        &backends,
                    )
                })
        }
        Op::DeleteFrontend { fe } => f.writer.delete_frontend(&frontend(*fe)).map(|_| ()),
        Op::DeleteBackends { svc, backends } => {
            let addrs: Vec<L3n4Addr> = backends.iter().map(|b| backend(*b)).collect();
            f.writer.delete_backends(&service(*svc), &addrs)
        }
        Op::DeleteService { svc } => f.writer.delete_service(&service(*svc)).map(|_| ()),
    };
}

fn check_tables(f: &Fixture) {
    let txn = f.writer.read_txn();
    for be in f.writer.backends().all(&txn) {
        assert!(!be.instances.is_empty(), "backend {} has no instances", be.address);
    }
    for fe in f.writer.frontends().all(&txn) {
        assert!(
            f.writer.services().get(&txn, &fe.service_name).is_some(),
            "frontend {} without service",
            fe.address
        );
        for addr in &fe.backends {
            let be = f.writer.backends().get(&txn, addr);
            assert!(
                be.is_some_and(|be| be.instance(&fe.service_name).is_some()),
                "frontend {} names backend {addr} without an instance",
                fe.address
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn writer_keeps_tables_consistent(ops in proptest::collection::vec(op(), 1..24)) {
        let mut f = Fixture::new();
        for op in &ops {
            apply(&f, op);
            check_tables(&f);
        }

        f.reconcile();
        let txn = f.writer.read_txn();
        let lines = f.dump();
        let frontends: Vec<Frontend> =
            f.writer.frontends().all(&txn).map(|o| Frontend::clone(o)).collect();

        // One master per frontend, counting exactly its backends.
        prop_assert_eq!(masters(&lines).len(), frontends.len());
        prop_assert_eq!(count_prefix(&lines, "REV:"), frontends.len());
        for fe in &frontends {
            prop_assert!(fe.status.is_done());
            let prefix = format!("ADDR={} SLOT=0 ", fe.address);
            let expected = format!(" COUNT={} ", fe.backends.len());
            prop_assert!(
                masters(&lines).iter().any(|l| l.contains(&prefix) && l.contains(&expected)),
                "no master {} {} in {:#?}", prefix, expected, lines
            );
        }

        let referenced: BTreeSet<L3n4Addr> =
            frontends.iter().flat_map(|fe| fe.backends.iter().copied()).collect();
        prop_assert_eq!(count_prefix(&lines, "BE:"), referenced.len());
    }
}
