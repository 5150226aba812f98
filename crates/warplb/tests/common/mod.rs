//! Shared fixture: a writer and a frontend reconciler over in-memory maps
//! wrapped in a fault injector.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Instant;

use warplb::dump::dump_lb_maps;
use warplb::*;
use warplb_reconciler::RoundStats;
use warplb_statedb::Db;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub struct Fixture {
    pub writer: Writer,
    pub reconciler: FrontendReconciler,
    pub maps: Arc<MemoryLbMaps>,
    pub faulty: Arc<FaultyLbMaps>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(LbConfig::default(), Arc::new(MemoryLbMaps::new()))
    }

    /// Build over existing map contents, as after a restart.
    pub fn with(config: LbConfig, maps: Arc<MemoryLbMaps>) -> Self {
        init_tracing();
        let faulty = Arc::new(FaultyLbMaps::new(maps.clone()));
        let (writer, reconciler) =
            new_control_plane(Db::new(), &config, faulty.clone()).expect("control plane");
        Self {
            writer,
            reconciler,
            maps,
            faulty,
        }
    }

    pub fn reconcile(&mut self) -> RoundStats {
        self.reconciler.step(Instant::now())
    }

    pub fn ops(&self) -> &BpfOps {
        self.reconciler.operations()
    }

    pub fn dump(&self) -> Vec<String> {
        dump_lb_maps(self.maps.as_ref(), false).expect("dump maps")
    }

    pub fn frontend(&self, addr: &L3n4Addr) -> Option<Frontend> {
        let txn = self.writer.read_txn();
        self.writer
            .frontends()
            .get(&txn, addr)
            .map(|o| Frontend::clone(o))
    }

    /// Create `name` (if needed) with one ClusterIP frontend and `backends`.
    pub fn add_service(&self, name: &ServiceName, frontend: L3n4Addr, backends: &[L3n4Addr]) {
        self.add_frontend(name, frontend, SvcType::ClusterIP, backends);
    }

    pub fn add_frontend(
        &self,
        name: &ServiceName,
        frontend: L3n4Addr,
        svc_type: SvcType,
        backends: &[L3n4Addr],
    ) {
        let txn = self.writer.read_txn();
        if self.writer.services().get(&txn, name).is_none() {
            self.writer
                .upsert_service(self.writer.new_service(name.clone(), "test"))
                .expect("upsert service");
        }
        let backends: Vec<BackendParams> = backends.iter().copied().map(BackendParams::new).collect();
        self.writer
            .upsert_frontend(frontend_params(name, frontend, svc_type), &backends)
            .expect("upsert frontend");
    }
}

pub fn frontend_params(name: &ServiceName, address: L3n4Addr, svc_type: SvcType) -> FrontendParams {
    FrontendParams {
        address,
        svc_type,
        service_name: name.clone(),
        port_name: String::new(),
    }
}

pub fn addr(s: &str) -> L3n4Addr {
    s.parse().expect("address")
}

/// Master service entries (slot 0) in the dump.
pub fn masters(lines: &[String]) -> Vec<&String> {
    lines
        .iter()
        .filter(|l| l.starts_with("SVC:") && l.contains(" SLOT=0 "))
        .collect()
}

pub fn count_prefix(lines: &[String], prefix: &str) -> usize {
    lines.iter().filter(|l| l.starts_with(prefix)).count()
}
