//! warplb: load-balancer control plane.
//!
//! Desired load-balancing state lives in four tables of a
//! [`warplb_statedb::Db`]: services, frontends, backends and node addresses.
//! The [`Writer`] is the only mutator of those tables and keeps them
//! consistent. A [`warplb_reconciler::Reconciler`] watches the frontends
//! table and hands every pending frontend to [`BpfOps`], which programs it
//! into the datapath maps behind [`LbMaps`].
//!
//! # Architecture
//!
//! ```text
//! upstream events ──► Writer ──► frontends / backends / services tables
//!                                        │
//!                                        ▼ (watch, delete tracker)
//!                                   Reconciler ──► BpfOps ──► LbMaps
//!                                        ▲                      │
//!                                        └── status (CAS) ◄─────┘
//! ```

pub mod bpf_ops;
pub mod config;
pub mod dump;
pub mod error;
pub mod events;
pub mod id_alloc;
pub mod maps;
pub mod tables;
pub mod types;
pub mod writer;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use warplb_reconciler::Reconciler;
use warplb_statedb::Db;

pub use bpf_ops::BpfOps;
pub use config::LbConfig;
pub use error::{LbError, LbResult, MapError};
pub use events::{Event, EventKind, ServiceSync};
pub use maps::{FaultyLbMaps, LbMaps, MemoryLbMaps};
pub use tables::{
    Backend, BackendInstance, BackendParams, Frontend, FrontendParams, LbTables, NodeAddress,
    Service,
};
pub use types::{
    AddrCluster, BackendState, Cidr, L3n4Addr, L4Type, Scope, ServiceName, SvcType,
    TrafficPolicy,
};
pub use writer::Writer;

/// The frontend reconciler driving [`BpfOps`].
pub type FrontendReconciler = Reconciler<Frontend, BpfOps>;

/// Register the tables in `db` and build the writer and the frontend
/// reconciler over `maps`.
pub fn new_control_plane(
    db: Db,
    config: &LbConfig,
    maps: Arc<dyn LbMaps>,
) -> LbResult<(Writer, FrontendReconciler)> {
    let tables = LbTables::register(&db)?;
    let ops = BpfOps::new(maps, tables.clone(), config)?;
    let reconciler = Reconciler::new(
        db.clone(),
        tables.frontends.clone(),
        ops,
        config.reconciler_config(),
    );
    let writer = Writer::new(db, tables, config);
    info!(
        max_services = config.loadbalancer.max_services,
        max_backends = config.loadbalancer.max_backends,
        "load-balancer control plane initialized"
    );
    Ok((writer, reconciler))
}

/// Run the reconciler on the current runtime until `shutdown` flips to
/// true. The task hands the reconciler back when it stops.
pub fn spawn_reconciler(
    reconciler: FrontendReconciler,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<FrontendReconciler> {
    tokio::spawn(reconciler.run(shutdown))
}
