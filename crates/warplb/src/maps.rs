//! Datapath load-balancing maps.
//!
//! [`LbMaps`] is the boundary to the kernel: five keyed maps holding service
//! slots, backends, reverse NAT entries, session-affinity matches and
//! source-range restrictions. Ports and reverse NAT IDs are stored in network
//! byte order as the datapath reads them; callers convert with
//! [`ByteOrder::to_network`] before writing and [`ByteOrder::to_host`] after
//! dumping.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::MapError;
use crate::types::{BackendState, Cidr, L3n4Addr, L4Type, Scope, SvcType};

pub const SERVICE_MAP: &str = "service";
pub const BACKEND_MAP: &str = "backend";
pub const REV_NAT_MAP: &str = "rev-nat";
pub const AFFINITY_MATCH_MAP: &str = "affinity-match";
pub const SOURCE_RANGE_MAP: &str = "source-range";

/// Conversion between host and network byte order of the multi-byte fields
/// the datapath reads in network order.
pub trait ByteOrder: Sized {
    fn to_network(self) -> Self;
    fn to_host(self) -> Self;
}

/// Service map key. Slot 0 is the master entry; slots `1..=n` hold backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: u8,
    pub scope: u8,
    pub backend_slot: u16,
}

impl ServiceKey {
    pub fn new(frontend: &L3n4Addr, backend_slot: u16) -> Self {
        Self {
            address: frontend.ip(),
            port: frontend.port,
            protocol: frontend.protocol.number(),
            scope: frontend.scope.number(),
            backend_slot,
        }
    }

    /// The frontend this key belongs to. Expects host byte order.
    pub fn frontend(&self) -> L3n4Addr {
        L3n4Addr::new(
            L4Type::from_number(self.protocol).unwrap_or(L4Type::Any),
            self.address,
            self.port,
            Scope::from_number(self.scope),
        )
    }
}

impl ByteOrder for ServiceKey {
    fn to_network(self) -> Self {
        Self {
            port: self.port.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            port: u16::from_be(self.port),
            ..self
        }
    }
}

/// Service map value. In the master slot `count`/`qcount` give the number
/// of active and quarantined backend slots; in a backend slot `backend_id`
/// names the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceValue {
    pub backend_id: u32,
    pub count: u16,
    pub qcount: u16,
    pub rev_nat_id: u16,
    pub flags: ServiceFlags,
    pub affinity_timeout_secs: u32,
}

impl ByteOrder for ServiceValue {
    fn to_network(self) -> Self {
        Self {
            rev_nat_id: self.rev_nat_id.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            rev_nat_id: u16::from_be(self.rev_nat_id),
            ..self
        }
    }
}

/// Backend map value, keyed by backend ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendValue {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: u8,
    pub flags: u8,
    pub cluster_id: u32,
}

impl BackendValue {
    pub fn new(address: &L3n4Addr, state: BackendState) -> Self {
        Self {
            address: address.ip(),
            port: address.port,
            protocol: address.protocol.number(),
            flags: state.flags(),
            cluster_id: address.addr.cluster_id,
        }
    }

    /// The backend address. Expects host byte order.
    pub fn backend(&self) -> L3n4Addr {
        let mut addr = L3n4Addr::new(
            L4Type::from_number(self.protocol).unwrap_or(L4Type::Any),
            self.address,
            self.port,
            Scope::External,
        );
        addr.addr.cluster_id = self.cluster_id;
        addr
    }

    pub fn state(&self) -> Option<BackendState> {
        BackendState::from_flags(self.flags)
    }
}

impl ByteOrder for BackendValue {
    fn to_network(self) -> Self {
        Self {
            port: self.port.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            port: u16::from_be(self.port),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevNatKey {
    pub id: u16,
}

impl ByteOrder for RevNatKey {
    fn to_network(self) -> Self {
        Self { id: self.id.to_be() }
    }

    fn to_host(self) -> Self {
        Self {
            id: u16::from_be(self.id),
        }
    }
}

/// Address return traffic is rewritten to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevNatValue {
    pub address: IpAddr,
    pub port: u16,
}

impl ByteOrder for RevNatValue {
    fn to_network(self) -> Self {
        Self {
            port: self.port.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            port: u16::from_be(self.port),
            ..self
        }
    }
}

/// Backends eligible for session affinity of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AffinityMatchKey {
    pub rev_nat_id: u16,
    pub backend_id: u32,
}

impl ByteOrder for AffinityMatchKey {
    fn to_network(self) -> Self {
        Self {
            rev_nat_id: self.rev_nat_id.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            rev_nat_id: u16::from_be(self.rev_nat_id),
            ..self
        }
    }
}

/// Client prefix allowed to reach a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRangeKey {
    pub rev_nat_id: u16,
    pub cidr: Cidr,
}

impl ByteOrder for SourceRangeKey {
    fn to_network(self) -> Self {
        Self {
            rev_nat_id: self.rev_nat_id.to_be(),
            ..self
        }
    }

    fn to_host(self) -> Self {
        Self {
            rev_nat_id: u16::from_be(self.rev_nat_id),
            ..self
        }
    }
}

/// Service entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServiceFlags(u16);

impl ServiceFlags {
    pub const EXTERNAL_IPS: u16 = 1 << 0;
    pub const NODE_PORT: u16 = 1 << 1;
    pub const EXT_LOCAL_SCOPE: u16 = 1 << 2;
    pub const HOST_PORT: u16 = 1 << 3;
    pub const SESSION_AFFINITY: u16 = 1 << 4;
    pub const LOADBALANCER: u16 = 1 << 5;
    pub const ROUTABLE: u16 = 1 << 6;
    pub const SOURCE_RANGE: u16 = 1 << 7;
    pub const INT_LOCAL_SCOPE: u16 = 1 << 8;

    pub fn new(svc_type: SvcType) -> Self {
        let mut bits = match svc_type {
            SvcType::ClusterIP => 0,
            SvcType::NodePort => Self::NODE_PORT,
            SvcType::LoadBalancer => Self::LOADBALANCER,
            SvcType::ExternalIPs => Self::EXTERNAL_IPS,
            SvcType::HostPort => Self::HOST_PORT,
        };
        if svc_type != SvcType::ClusterIP {
            bits |= Self::ROUTABLE;
        }
        Self(bits)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn with(self, flag: u16, enabled: bool) -> Self {
        if enabled { Self(self.0 | flag) } else { self }
    }

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn svc_type(self) -> SvcType {
        if self.contains(Self::NODE_PORT) {
            SvcType::NodePort
        } else if self.contains(Self::LOADBALANCER) {
            SvcType::LoadBalancer
        } else if self.contains(Self::EXTERNAL_IPS) {
            SvcType::ExternalIPs
        } else if self.contains(Self::HOST_PORT) {
            SvcType::HostPort
        } else {
            SvcType::ClusterIP
        }
    }
}

/// Renders as `ClusterIP+non-routable` or `LoadBalancer+sessionAffinity+check source-range`.
impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.svc_type())?;
        let named = [
            (Self::EXT_LOCAL_SCOPE, "Local"),
            (Self::INT_LOCAL_SCOPE, "InternalLocal"),
            (Self::SESSION_AFFINITY, "sessionAffinity"),
            (Self::SOURCE_RANGE, "check source-range"),
        ];
        for (flag, name) in named {
            if self.contains(flag) {
                write!(f, "+{name}")?;
            }
        }
        if !self.contains(Self::ROUTABLE) {
            write!(f, "+non-routable")?;
        }
        Ok(())
    }
}

/// The kernel load-balancing maps.
///
/// Keys and values are passed in network byte order. Deleting a missing key
/// succeeds. Dump callbacks must not call back into the maps.
pub trait LbMaps: Send + Sync {
    fn update_service(&self, key: ServiceKey, value: ServiceValue) -> Result<(), MapError>;
    fn delete_service(&self, key: ServiceKey) -> Result<(), MapError>;
    fn dump_service(&self, cb: &mut dyn FnMut(ServiceKey, ServiceValue)) -> Result<(), MapError>;

    fn update_backend(&self, id: u32, value: BackendValue) -> Result<(), MapError>;
    fn delete_backend(&self, id: u32) -> Result<(), MapError>;
    fn dump_backend(&self, cb: &mut dyn FnMut(u32, BackendValue)) -> Result<(), MapError>;

    fn update_rev_nat(&self, key: RevNatKey, value: RevNatValue) -> Result<(), MapError>;
    fn delete_rev_nat(&self, key: RevNatKey) -> Result<(), MapError>;
    fn dump_rev_nat(&self, cb: &mut dyn FnMut(RevNatKey, RevNatValue)) -> Result<(), MapError>;

    fn update_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError>;
    fn delete_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError>;
    fn dump_affinity_match(&self, cb: &mut dyn FnMut(AffinityMatchKey)) -> Result<(), MapError>;

    fn update_source_range(&self, key: SourceRangeKey) -> Result<(), MapError>;
    fn delete_source_range(&self, key: SourceRangeKey) -> Result<(), MapError>;
    fn dump_source_range(&self, cb: &mut dyn FnMut(SourceRangeKey)) -> Result<(), MapError>;
}

#[derive(Default)]
struct MapContents {
    services: BTreeMap<ServiceKey, ServiceValue>,
    backends: BTreeMap<u32, BackendValue>,
    rev_nat: BTreeMap<RevNatKey, RevNatValue>,
    affinity: BTreeMap<AffinityMatchKey, ()>,
    source_ranges: BTreeMap<SourceRangeKey, ()>,
}

/// In-memory maps. Counts every update and delete call.
#[derive(Default)]
pub struct MemoryLbMaps {
    contents: Mutex<MapContents>,
    mutations: AtomicU64,
}

impl MemoryLbMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of update and delete calls so far.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Whether every map is empty.
    pub fn is_empty(&self) -> bool {
        let c = self.contents.lock();
        c.services.is_empty()
            && c.backends.is_empty()
            && c.rev_nat.is_empty()
            && c.affinity.is_empty()
            && c.source_ranges.is_empty()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MapContents) -> R) -> R {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        f(&mut self.contents.lock())
    }
}

impl LbMaps for MemoryLbMaps {
    fn update_service(&self, key: ServiceKey, value: ServiceValue) -> Result<(), MapError> {
        self.mutate(|c| c.services.insert(key, value));
        Ok(())
    }

    fn delete_service(&self, key: ServiceKey) -> Result<(), MapError> {
        self.mutate(|c| c.services.remove(&key));
        Ok(())
    }

    fn dump_service(&self, cb: &mut dyn FnMut(ServiceKey, ServiceValue)) -> Result<(), MapError> {
        let entries: Vec<_> = self.contents.lock().services.iter().map(|(k, v)| (*k, *v)).collect();
        entries.into_iter().for_each(|(k, v)| cb(k, v));
        Ok(())
    }

    fn update_backend(&self, id: u32, value: BackendValue) -> Result<(), MapError> {
        self.mutate(|c| c.backends.insert(id, value));
        Ok(())
    }

    fn delete_backend(&self, id: u32) -> Result<(), MapError> {
        self.mutate(|c| c.backends.remove(&id));
        Ok(())
    }

    fn dump_backend(&self, cb: &mut dyn FnMut(u32, BackendValue)) -> Result<(), MapError> {
        let entries: Vec<_> = self.contents.lock().backends.iter().map(|(k, v)| (*k, *v)).collect();
        entries.into_iter().for_each(|(k, v)| cb(k, v));
        Ok(())
    }

    fn update_rev_nat(&self, key: RevNatKey, value: RevNatValue) -> Result<(), MapError> {
        self.mutate(|c| c.rev_nat.insert(key, value));
        Ok(())
    }

    fn delete_rev_nat(&self, key: RevNatKey) -> Result<(), MapError> {
        self.mutate(|c| c.rev_nat.remove(&key));
        Ok(())
    }

    fn dump_rev_nat(&self, cb: &mut dyn FnMut(RevNatKey, RevNatValue)) -> Result<(), MapError> {
        let entries: Vec<_> = self.contents.lock().rev_nat.iter().map(|(k, v)| (*k, *v)).collect();
        entries.into_iter().for_each(|(k, v)| cb(k, v));
        Ok(())
    }

    fn update_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError> {
        self.mutate(|c| c.affinity.insert(key, ()));
        Ok(())
    }

    fn delete_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError> {
        self.mutate(|c| c.affinity.remove(&key));
        Ok(())
    }

    fn dump_affinity_match(&self, cb: &mut dyn FnMut(AffinityMatchKey)) -> Result<(), MapError> {
        let keys: Vec<_> = self.contents.lock().affinity.keys().copied().collect();
        keys.into_iter().for_each(|k| cb(k));
        Ok(())
    }

    fn update_source_range(&self, key: SourceRangeKey) -> Result<(), MapError> {
        self.mutate(|c| c.source_ranges.insert(key, ()));
        Ok(())
    }

    fn delete_source_range(&self, key: SourceRangeKey) -> Result<(), MapError> {
        self.mutate(|c| c.source_ranges.remove(&key));
        Ok(())
    }

    fn dump_source_range(&self, cb: &mut dyn FnMut(SourceRangeKey)) -> Result<(), MapError> {
        let keys: Vec<_> = self.contents.lock().source_ranges.keys().copied().collect();
        keys.into_iter().for_each(|k| cb(k));
        Ok(())
    }
}

/// Wraps another implementation and fails the next `n` mutations with
/// [`MapError::Injected`]. Dumps always pass through.
pub struct FaultyLbMaps {
    inner: Arc<dyn LbMaps>,
    fail_next: AtomicUsize,
}

impl FaultyLbMaps {
    pub fn new(inner: Arc<dyn LbMaps>) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check(&self, map: &'static str) -> Result<(), MapError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(map, "injecting map failure");
            return Err(MapError::Injected { map });
        }
        Ok(())
    }
}

impl LbMaps for FaultyLbMaps {
    fn update_service(&self, key: ServiceKey, value: ServiceValue) -> Result<(), MapError> {
        self.check(SERVICE_MAP)?;
        self.inner.update_service(key, value)
    }

    fn delete_service(&self, key: ServiceKey) -> Result<(), MapError> {
        self.check(SERVICE_MAP)?;
        self.inner.delete_service(key)
    }

    fn dump_service(&self, cb: &mut dyn FnMut(ServiceKey, ServiceValue)) -> Result<(), MapError> {
        self.inner.dump_service(cb)
    }

    fn update_backend(&self, id: u32, value: BackendValue) -> Result<(), MapError> {
        self.check(BACKEND_MAP)?;
        self.inner.update_backend(id, value)
    }

    fn delete_backend(&self, id: u32) -> Result<(), MapError> {
        self.check(BACKEND_MAP)?;
        self.inner.delete_backend(id)
    }

    fn dump_backend(&self, cb: &mut dyn FnMut(u32, BackendValue)) -> Result<(), MapError> {
        self.inner.dump_backend(cb)
    }

    fn update_rev_nat(&self, key: RevNatKey, value: RevNatValue) -> Result<(), MapError> {
        self.check(REV_NAT_MAP)?;
        self.inner.update_rev_nat(key, value)
    }

    fn delete_rev_nat(&self, key: RevNatKey) -> Result<(), MapError> {
        self.check(REV_NAT_MAP)?;
        self.inner.delete_rev_nat(key)
    }

    fn dump_rev_nat(&self, cb: &mut dyn FnMut(RevNatKey, RevNatValue)) -> Result<(), MapError> {
        self.inner.dump_rev_nat(cb)
    }

    fn update_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError> {
        self.check(AFFINITY_MATCH_MAP)?;
        self.inner.update_affinity_match(key)
    }

    fn delete_affinity_match(&self, key: AffinityMatchKey) -> Result<(), MapError> {
        self.check(AFFINITY_MATCH_MAP)?;
        self.inner.delete_affinity_match(key)
    }

    fn dump_affinity_match(&self, cb: &mut dyn FnMut(AffinityMatchKey)) -> Result<(), MapError> {
        self.inner.dump_affinity_match(cb)
    }

    fn update_source_range(&self, key: SourceRangeKey) -> Result<(), MapError> {
        self.check(SOURCE_RANGE_MAP)?;
        self.inner.update_source_range(key)
    }

    fn delete_source_range(&self, key: SourceRangeKey) -> Result<(), MapError> {
        self.check(SOURCE_RANGE_MAP)?;
        self.inner.delete_source_range(key)
    }

    fn dump_source_range(&self, cb: &mut dyn FnMut(SourceRangeKey)) -> Result<(), MapError> {
        self.inner.dump_source_range(cb)
    }
}
