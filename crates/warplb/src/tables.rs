//! Service, Frontend, Backend and NodeAddress tables.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use warplb_reconciler::{Reconcilable, Status};
use warplb_statedb::{Db, IndexKey, SecondaryIndex, Table, TableObject};

use crate::error::LbResult;
use crate::types::{BackendState, Cidr, L3n4Addr, ServiceName, SvcType, TrafficPolicy};

/// Name of the by-service secondary index on frontends and backends.
pub const SERVICE_INDEX: &str = "service";

pub fn service_key(name: &ServiceName) -> IndexKey {
    IndexKey::from(name.to_string())
}

/// A logical service. Its frontends and backends refer to it by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub name: ServiceName,
    /// Origin of the service, e.g. `k8s`.
    pub source: String,
    pub ext_traffic_policy: TrafficPolicy,
    pub int_traffic_policy: TrafficPolicy,
    pub session_affinity: bool,
    pub session_affinity_timeout: Duration,
    /// Client ranges allowed to reach LoadBalancer frontends. Empty allows all.
    pub source_ranges: Vec<Cidr>,
}

impl Service {
    pub fn new(name: ServiceName, source: impl Into<String>) -> Self {
        Self {
            name,
            source: source.into(),
            ext_traffic_policy: TrafficPolicy::Cluster,
            int_traffic_policy: TrafficPolicy::Cluster,
            session_affinity: false,
            session_affinity_timeout: Duration::from_secs(3 * 3600),
            source_ranges: Vec::new(),
        }
    }

    /// Traffic policy applying to frontends of the given scope.
    pub fn traffic_policy(&self, internal: bool) -> TrafficPolicy {
        if internal {
            self.int_traffic_policy
        } else {
            self.ext_traffic_policy
        }
    }
}

impl TableObject for Service {
    type Key = ServiceName;

    fn primary_key(&self) -> ServiceName {
        self.name.clone()
    }
}

/// The caller-controlled part of a [`Frontend`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrontendParams {
    pub address: L3n4Addr,
    pub svc_type: SvcType,
    pub service_name: ServiceName,
    /// Backends are selected by matching instance port name. Empty selects
    /// every backend of the service.
    pub port_name: String,
}

/// A reachable address of a service, with its selected backends and
/// reconciliation status.
#[derive(Debug, Clone, Serialize)]
pub struct Frontend {
    pub address: L3n4Addr,
    pub svc_type: SvcType,
    pub service_name: ServiceName,
    pub port_name: String,
    /// Backend addresses in slot order.
    pub backends: Vec<L3n4Addr>,
    #[serde(skip)]
    pub status: Status,
}

impl Frontend {
    pub fn new(params: FrontendParams, backends: Vec<L3n4Addr>) -> Self {
        Self {
            address: params.address,
            svc_type: params.svc_type,
            service_name: params.service_name,
            port_name: params.port_name,
            backends,
            status: Status::pending(),
        }
    }

    pub fn params(&self) -> FrontendParams {
        FrontendParams {
            address: self.address,
            svc_type: self.svc_type,
            service_name: self.service_name.clone(),
            port_name: self.port_name.clone(),
        }
    }

    /// Equal desired state, ignoring status.
    pub fn same_desired(&self, other: &Frontend) -> bool {
        self.address == other.address
            && self.svc_type == other.svc_type
            && self.service_name == other.service_name
            && self.port_name == other.port_name
            && self.backends == other.backends
    }

    /// An unspecified address expands to every node address.
    pub fn is_node_port_surrogate(&self) -> bool {
        self.address.ip().is_unspecified()
            && matches!(self.svc_type, SvcType::NodePort | SvcType::HostPort)
    }
}

impl TableObject for Frontend {
    type Key = L3n4Addr;

    fn primary_key(&self) -> L3n4Addr {
        self.address
    }
}

impl Reconcilable for Frontend {
    fn status(&self) -> &Status {
        &self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }
}

/// Membership of a backend in one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInstance {
    pub port_name: String,
    pub state: BackendState,
}

/// A destination shared by any number of services. The row exists exactly
/// as long as `instances` is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Backend {
    pub address: L3n4Addr,
    pub node_name: String,
    pub instances: BTreeMap<ServiceName, BackendInstance>,
}

impl Backend {
    pub fn instance(&self, service: &ServiceName) -> Option<&BackendInstance> {
        self.instances.get(service)
    }
}

impl TableObject for Backend {
    type Key = L3n4Addr;

    fn primary_key(&self) -> L3n4Addr {
        self.address
    }
}

/// The caller-controlled part of a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendParams {
    pub address: L3n4Addr,
    pub node_name: String,
    pub port_name: String,
    pub state: BackendState,
}

impl BackendParams {
    pub fn new(address: L3n4Addr) -> Self {
        Self {
            address,
            node_name: String::new(),
            port_name: String::new(),
            state: BackendState::Active,
        }
    }

    pub fn instance(&self) -> BackendInstance {
        BackendInstance {
            port_name: self.port_name.clone(),
            state: self.state,
        }
    }
}

/// An address of this node. NodePort frontends are expanded to every
/// address with `node_port` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    pub addr: IpAddr,
    pub node_port: bool,
    pub primary: bool,
    pub device: String,
}

impl TableObject for NodeAddress {
    type Key = IpAddr;

    fn primary_key(&self) -> IpAddr {
        self.addr
    }
}

/// Handles to all load-balancing tables of a [`Db`].
#[derive(Clone)]
pub struct LbTables {
    pub services: Table<Service>,
    pub frontends: Table<Frontend>,
    pub backends: Table<Backend>,
    pub node_addresses: Table<NodeAddress>,
}

impl LbTables {
    pub fn register(db: &Db) -> LbResult<Self> {
        let services = db.new_table("services", vec![])?;
        let frontends = db.new_table(
            "frontends",
            vec![SecondaryIndex::new(SERVICE_INDEX, |fe: &Frontend| {
                vec![service_key(&fe.service_name)]
            })],
        )?;
        let backends = db.new_table(
            "backends",
            vec![SecondaryIndex::new(SERVICE_INDEX, |be: &Backend| {
                be.instances.keys().map(service_key).collect()
            })],
        )?;
        let node_addresses = db.new_table("node-addresses", vec![])?;
        Ok(Self {
            services,
            frontends,
            backends,
            node_addresses,
        })
    }
}
