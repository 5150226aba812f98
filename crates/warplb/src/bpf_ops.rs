//! Programs frontends into the load-balancing maps.
//!
//! [`BpfOps`] implements [`Operations<Frontend>`] for the reconciler. Every
//! frontend address gets a service ID (doubling as its reverse NAT ID), a
//! master entry, one slot per selected backend and the reverse NAT,
//! affinity and source-range entries the service calls for. Backends are
//! shared between frontends and reference counted; the backend entry and
//! its ID go away with the last reference. A shared backend's entry carries
//! the best state any referencing frontend selected it in, so the entry does
//! not depend on which frontend was programmed last.
//!
//! Writes go out in dependency order: backends before the slots pointing at
//! them, slots before the master entry advertising them, and only then are
//! superseded slots and unreferenced backends removed. The datapath never
//! sees a master entry counting slots that do not exist.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use warplb_reconciler::Operations;
use warplb_statedb::ReadTxn;

use crate::config::LbConfig;
use crate::error::{LbError, LbResult, MapError};
use crate::id_alloc::IdAllocator;
use crate::maps::{
    AFFINITY_MATCH_MAP, AffinityMatchKey, BACKEND_MAP, BackendValue, ByteOrder, LbMaps,
    REV_NAT_MAP, RevNatKey, RevNatValue, SERVICE_MAP, SOURCE_RANGE_MAP, ServiceFlags, ServiceKey,
    ServiceValue, SourceRangeKey,
};
use crate::tables::{Frontend, LbTables, Service};
use crate::types::{BackendState, L3n4Addr, Scope, SvcType, TrafficPolicy};

/// What was last written for one frontend address, in host byte order.
#[derive(Debug, Clone, Default)]
struct Programmed {
    master: Option<ServiceValue>,
    /// Slot `i + 1`.
    slots: Vec<ServiceValue>,
    rev_nat: Option<RevNatValue>,
    backends: Vec<L3n4Addr>,
    affinity: BTreeSet<AffinityMatchKey>,
    source_ranges: BTreeSet<SourceRangeKey>,
}

/// Everything one address should carry.
struct Desired {
    backends: Vec<(L3n4Addr, BackendState)>,
    active: u16,
    quarantined: u16,
    flags: ServiceFlags,
    affinity: bool,
    affinity_timeout_secs: u32,
}

pub struct BpfOps {
    maps: Arc<dyn LbMaps>,
    tables: LbTables,
    enable_session_affinity: bool,
    node_name: String,
    map_timeout: Duration,

    service_ids: IdAllocator<L3n4Addr>,
    backend_ids: IdAllocator<L3n4Addr>,
    /// Frontend addresses referencing each backend, with the state each
    /// selected it in.
    backend_references: HashMap<L3n4Addr, HashMap<L3n4Addr, BackendState>>,
    /// Backend entries as last written.
    backend_states: HashMap<L3n4Addr, BackendValue>,
    /// Node addresses a NodePort surrogate was expanded to.
    node_port_addrs: HashMap<L3n4Addr, Vec<IpAddr>>,
    programmed: HashMap<L3n4Addr, Programmed>,

    /// IDs recovered from the maps and not yet claimed by a frontend.
    restored_services: HashSet<L3n4Addr>,
    restored_backends: HashSet<L3n4Addr>,
}

impl BpfOps {
    /// Create the operations and recover service and backend IDs from the
    /// current map contents, so a restart keeps existing IDs stable.
    pub fn new(maps: Arc<dyn LbMaps>, tables: LbTables, config: &LbConfig) -> LbResult<Self> {
        let lb = &config.loadbalancer;
        let mut ops = Self {
            maps,
            tables,
            enable_session_affinity: lb.enable_session_affinity,
            node_name: lb.node_name.clone(),
            map_timeout: config.map_timeout(),
            service_ids: IdAllocator::new("service", lb.max_services),
            backend_ids: IdAllocator::new("backend", lb.max_backends),
            backend_references: HashMap::new(),
            backend_states: HashMap::new(),
            node_port_addrs: HashMap::new(),
            programmed: HashMap::new(),
            restored_services: HashSet::new(),
            restored_backends: HashSet::new(),
        };
        ops.restore()?;
        Ok(ops)
    }

    fn restore(&mut self) -> LbResult<()> {
        let mut backends = Vec::new();
        self.maps
            .dump_backend(&mut |id, value| backends.push((id, value.to_host())))?;
        for (id, value) in backends {
            let addr = value.backend();
            match self.backend_ids.restore(&addr, id) {
                Ok(()) => {
                    self.restored_backends.insert(addr);
                    self.backend_states.insert(addr, value);
                }
                Err(e) => warn!(id, %addr, error = %e, "skipping unrestorable backend"),
            }
        }

        let mut masters = Vec::new();
        self.maps.dump_service(&mut |key, value| {
            let key = key.to_host();
            if key.backend_slot == 0 {
                masters.push((key.frontend(), value.to_host().rev_nat_id));
            }
        })?;
        for (frontend, id) in masters {
            match self.service_ids.restore(&frontend, u32::from(id)) {
                Ok(()) => {
                    self.restored_services.insert(frontend);
                }
                Err(e) => warn!(id, %frontend, error = %e, "skipping unrestorable service"),
            }
        }

        if !self.restored_services.is_empty() || !self.restored_backends.is_empty() {
            info!(
                services = self.restored_services.len(),
                backends = self.restored_backends.len(),
                "restored datapath IDs"
            );
        }
        Ok(())
    }

    pub fn service_id(&self, frontend: &L3n4Addr) -> Option<u32> {
        self.service_ids.lookup(frontend)
    }

    pub fn backend_id(&self, backend: &L3n4Addr) -> Option<u32> {
        self.backend_ids.lookup(backend)
    }

    /// Number of frontend addresses referencing `backend`.
    pub fn backend_refcount(&self, backend: &L3n4Addr) -> usize {
        self.backend_references.get(backend).map_or(0, HashMap::len)
    }

    /// Write the backend entry if the state merged over all references
    /// differs from what was last written.
    fn sync_backend(&mut self, backend: &L3n4Addr, backend_id: u32) -> LbResult<()> {
        let Some(state) = self
            .backend_references
            .get(backend)
            .and_then(|refs| merged_state(refs.values().copied()))
        else {
            return Ok(());
        };
        let value = BackendValue::new(backend, state);
        if self.backend_states.get(backend) != Some(&value) {
            self.map_op(BACKEND_MAP, |m| m.update_backend(backend_id, value.to_network()))?;
            self.backend_states.insert(*backend, value);
        }
        Ok(())
    }

    /// True when no frontend is programmed and no ID is held.
    pub fn is_idle(&self) -> bool {
        self.service_ids.is_empty()
            && self.backend_ids.is_empty()
            && self.backend_references.is_empty()
            && self.backend_states.is_empty()
            && self.node_port_addrs.is_empty()
            && self.programmed.is_empty()
    }

    /// Run a map operation, failing it if it took longer than the timeout.
    fn map_op(
        &self,
        map: &'static str,
        op: impl FnOnce(&dyn LbMaps) -> Result<(), MapError>,
    ) -> LbResult<()> {
        let start = Instant::now();
        let result = op(self.maps.as_ref());
        let elapsed = start.elapsed();
        result?;
        if elapsed > self.map_timeout {
            warn!(map, ?elapsed, "map operation exceeded timeout");
            return Err(MapError::Timeout { map, elapsed }.into());
        }
        Ok(())
    }

    fn update_frontend(&mut self, txn: &ReadTxn, fe: &Frontend) -> LbResult<()> {
        let svc = self
            .tables
            .services
            .get(txn, &fe.service_name)
            .ok_or_else(|| {
                LbError::InvariantViolation(format!(
                    "frontend {} refers to missing service {}",
                    fe.address, fe.service_name
                ))
            })?
            .data()
            .clone();
        let desired = self.desired(txn, fe, &svc)?;

        // A frontend that stopped being a surrogate (or whose row was
        // recreated with another type) drops its old expansions here.
        let ips: Vec<IpAddr> = if fe.is_node_port_surrogate() {
            self.tables
                .node_addresses
                .all(txn)
                .filter(|n| n.node_port && n.addr.is_ipv6() == fe.address.is_ipv6())
                .map(|n| n.addr)
                .collect()
        } else {
            Vec::new()
        };
        let previous = self.node_port_addrs.get(&fe.address).cloned().unwrap_or_default();
        for ip in previous.iter().filter(|ip| !ips.contains(ip)) {
            self.delete_address(&fe.address.with_ip(*ip))?;
        }
        let mut addrs = vec![fe.address];
        addrs.extend(ips.iter().map(|ip| fe.address.with_ip(*ip)));
        if ips.is_empty() {
            self.node_port_addrs.remove(&fe.address);
        } else {
            self.node_port_addrs.insert(fe.address, ips);
        }

        for addr in &addrs {
            self.program_address(addr, fe.svc_type, &svc, &desired)?;
        }
        debug!(
            address = %fe.address,
            addresses = addrs.len(),
            backends = desired.backends.len(),
            "frontend programmed"
        );
        Ok(())
    }

    /// Backends of `fe` that belong in the datapath, active ones first.
    fn desired(&self, txn: &ReadTxn, fe: &Frontend, svc: &Service) -> LbResult<Desired> {
        let local = svc.traffic_policy(fe.address.scope == Scope::Internal) == TrafficPolicy::Local;
        let mut active = Vec::new();
        let mut quarantined = Vec::new();
        for addr in &fe.backends {
            let backend = self.tables.backends.get(txn, addr).ok_or_else(|| {
                LbError::InvariantViolation(format!(
                    "frontend {} refers to missing backend {addr}",
                    fe.address
                ))
            })?;
            let instance = backend.instance(&fe.service_name).ok_or_else(|| {
                LbError::InvariantViolation(format!(
                    "backend {addr} has no instance for {}",
                    fe.service_name
                ))
            })?;
            if addr.is_ipv6() != fe.address.is_ipv6() {
                continue;
            }
            if local && backend.node_name != self.node_name {
                continue;
            }
            match instance.state {
                BackendState::Active => active.push((*addr, BackendState::Active)),
                BackendState::Quarantined => quarantined.push((*addr, BackendState::Quarantined)),
                BackendState::Terminating => {}
            }
        }

        let count = |n: usize| {
            u16::try_from(n).map_err(|_| LbError::InvariantViolation(format!(
                "frontend {} selects {n} backends",
                fe.address
            )))
        };
        let affinity = self.enable_session_affinity && svc.session_affinity;
        let flags = ServiceFlags::new(fe.svc_type)
            .with(
                ServiceFlags::EXT_LOCAL_SCOPE,
                fe.svc_type != SvcType::ClusterIP && svc.ext_traffic_policy == TrafficPolicy::Local,
            )
            .with(ServiceFlags::INT_LOCAL_SCOPE, svc.int_traffic_policy == TrafficPolicy::Local)
            .with(ServiceFlags::SESSION_AFFINITY, affinity);
        Ok(Desired {
            active: count(active.len())?,
            quarantined: count(quarantined.len())?,
            backends: active.into_iter().chain(quarantined).collect(),
            flags,
            affinity,
            affinity_timeout_secs: if affinity {
                u32::try_from(svc.session_affinity_timeout.as_secs()).unwrap_or(u32::MAX)
            } else {
                0
            },
        })
    }

    fn program_address(
        &mut self,
        addr: &L3n4Addr,
        svc_type: SvcType,
        svc: &Service,
        desired: &Desired,
    ) -> LbResult<()> {
        let id = self.service_ids.allocate(addr)?;
        self.restored_services.remove(addr);
        let rev_nat_id =
            u16::try_from(id).map_err(|_| LbError::IdExhausted { kind: "service" })?;
        let prev = self.programmed.get(addr).cloned().unwrap_or_default();

        let source_ranges: BTreeSet<SourceRangeKey> = if svc_type == SvcType::LoadBalancer {
            svc.source_ranges
                .iter()
                .filter(|cidr| cidr.is_ipv6() == addr.is_ipv6())
                .map(|cidr| SourceRangeKey { rev_nat_id, cidr: *cidr })
                .collect()
        } else {
            BTreeSet::new()
        };
        let flags = desired
            .flags
            .with(ServiceFlags::SOURCE_RANGE, !source_ranges.is_empty());

        // Backend entries first.
        let mut slots = Vec::with_capacity(desired.backends.len());
        let mut backends = Vec::with_capacity(desired.backends.len());
        for (backend, state) in &desired.backends {
            let backend_id = self.backend_ids.allocate(backend)?;
            self.restored_backends.remove(backend);
            self.backend_references
                .entry(*backend)
                .or_default()
                .insert(*addr, *state);
            self.sync_backend(backend, backend_id)?;
            backends.push(*backend);
            slots.push(ServiceValue {
                backend_id,
                rev_nat_id,
                flags,
                ..ServiceValue::default()
            });
        }

        for (i, value) in slots.iter().enumerate() {
            if prev.slots.get(i) == Some(value) {
                continue;
            }
            let key = ServiceKey::new(addr, slot_number(i)?);
            self.map_op(SERVICE_MAP, |m| {
                m.update_service(key.to_network(), value.to_network())
            })?;
        }

        let master = ServiceValue {
            backend_id: 0,
            count: desired.active,
            qcount: desired.quarantined,
            rev_nat_id,
            flags,
            affinity_timeout_secs: desired.affinity_timeout_secs,
        };
        if prev.master != Some(master) {
            let key = ServiceKey::new(addr, 0);
            self.map_op(SERVICE_MAP, |m| {
                m.update_service(key.to_network(), master.to_network())
            })?;
        }

        for i in slots.len()..prev.slots.len() {
            let key = ServiceKey::new(addr, slot_number(i)?);
            self.map_op(SERVICE_MAP, |m| m.delete_service(key.to_network()))?;
        }

        let rev_nat = RevNatValue {
            address: addr.ip(),
            port: addr.port,
        };
        if prev.rev_nat != Some(rev_nat) {
            let key = RevNatKey { id: rev_nat_id };
            self.map_op(REV_NAT_MAP, |m| {
                m.update_rev_nat(key.to_network(), rev_nat.to_network())
            })?;
        }

        let affinity: BTreeSet<AffinityMatchKey> = if desired.affinity {
            slots
                .iter()
                .map(|slot| AffinityMatchKey {
                    rev_nat_id,
                    backend_id: slot.backend_id,
                })
                .collect()
        } else {
            BTreeSet::new()
        };
        for key in affinity.difference(&prev.affinity) {
            self.map_op(AFFINITY_MATCH_MAP, |m| m.update_affinity_match(key.to_network()))?;
        }
        for key in prev.affinity.difference(&affinity) {
            self.map_op(AFFINITY_MATCH_MAP, |m| m.delete_affinity_match(key.to_network()))?;
        }

        for key in source_ranges.difference(&prev.source_ranges) {
            self.map_op(SOURCE_RANGE_MAP, |m| m.update_source_range(key.to_network()))?;
        }
        for key in prev.source_ranges.difference(&source_ranges) {
            self.map_op(SOURCE_RANGE_MAP, |m| m.delete_source_range(key.to_network()))?;
        }

        for backend in prev.backends.iter().filter(|b| !backends.contains(b)) {
            self.release_backend(backend, addr)?;
        }

        self.programmed.insert(
            *addr,
            Programmed {
                master: Some(master),
                slots,
                rev_nat: Some(rev_nat),
                backends,
                affinity,
                source_ranges,
            },
        );
        Ok(())
    }

    /// Drop the reference `frontend` holds on `backend`. The last reference
    /// removes the backend entry and frees its ID.
    fn release_backend(&mut self, backend: &L3n4Addr, frontend: &L3n4Addr) -> LbResult<()> {
        let Some(refs) = self.backend_references.get_mut(backend) else {
            return Ok(());
        };
        refs.remove(frontend);
        if !refs.is_empty() {
            if let Some(id) = self.backend_ids.lookup(backend) {
                self.sync_backend(backend, id)?;
            }
            return Ok(());
        }
        if let Some(id) = self.backend_ids.lookup(backend) {
            self.map_op(BACKEND_MAP, |m| m.delete_backend(id))?;
        }
        self.backend_references.remove(backend);
        self.backend_states.remove(backend);
        self.backend_ids.free(backend);
        debug!(%backend, "backend released");
        Ok(())
    }

    /// Remove every entry of one frontend address and free its service ID.
    fn delete_address(&mut self, addr: &L3n4Addr) -> LbResult<()> {
        if let Some(id) = self.service_ids.lookup(addr) {
            let rev_nat_id =
                u16::try_from(id).map_err(|_| LbError::IdExhausted { kind: "service" })?;
            if let Some(prev) = self.programmed.get(addr).cloned() {
                for key in &prev.affinity {
                    self.map_op(AFFINITY_MATCH_MAP, |m| m.delete_affinity_match(key.to_network()))?;
                }
                for key in &prev.source_ranges {
                    self.map_op(SOURCE_RANGE_MAP, |m| m.delete_source_range(key.to_network()))?;
                }
                for i in 0..prev.slots.len() {
                    let key = ServiceKey::new(addr, slot_number(i)?);
                    self.map_op(SERVICE_MAP, |m| m.delete_service(key.to_network()))?;
                }
            }
            let master = ServiceKey::new(addr, 0);
            self.map_op(SERVICE_MAP, |m| m.delete_service(master.to_network()))?;
            let rev_nat = RevNatKey { id: rev_nat_id };
            self.map_op(REV_NAT_MAP, |m| m.delete_rev_nat(rev_nat.to_network()))?;
        }

        let referenced: Vec<L3n4Addr> = self
            .backend_references
            .iter()
            .filter(|(_, frontends)| frontends.contains_key(addr))
            .map(|(backend, _)| *backend)
            .collect();
        for backend in &referenced {
            self.release_backend(backend, addr)?;
        }

        self.programmed.remove(addr);
        self.restored_services.remove(addr);
        if let Some(id) = self.service_ids.free(addr) {
            debug!(%addr, id, "frontend address removed");
        }
        Ok(())
    }

    fn delete_frontend(&mut self, fe: &Frontend) -> LbResult<()> {
        let mut addrs = vec![fe.address];
        if let Some(ips) = self.node_port_addrs.get(&fe.address) {
            addrs.extend(ips.iter().map(|ip| fe.address.with_ip(*ip)));
        }
        for addr in &addrs {
            self.delete_address(addr)?;
        }
        self.node_port_addrs.remove(&fe.address);
        Ok(())
    }

    /// Free IDs nothing claimed and delete map entries no live ID accounts
    /// for.
    fn prune_maps(&mut self, frontends: &mut dyn Iterator<Item = &Frontend>) -> LbResult<()> {
        let mut wanted: HashSet<L3n4Addr> = HashSet::new();
        for fe in frontends {
            wanted.insert(fe.address);
            if let Some(ips) = self.node_port_addrs.get(&fe.address) {
                wanted.extend(ips.iter().map(|ip| fe.address.with_ip(*ip)));
            }
        }

        let unclaimed: Vec<L3n4Addr> = self
            .restored_services
            .iter()
            .filter(|addr| !wanted.contains(addr))
            .copied()
            .collect();
        for addr in &unclaimed {
            self.restored_services.remove(addr);
            self.service_ids.free(addr);
        }
        let unreferenced: Vec<L3n4Addr> = self
            .backend_ids
            .iter()
            .map(|(_, backend)| *backend)
            .filter(|backend| self.backend_refcount(backend) == 0)
            .collect();
        for backend in &unreferenced {
            self.backend_ids.free(backend);
            self.backend_states.remove(backend);
            self.backend_references.remove(backend);
        }
        self.restored_backends.clear();

        let mut services = Vec::new();
        self.maps.dump_service(&mut |key, value| {
            let (key, value) = (key.to_host(), value.to_host());
            let frontend = key.frontend();
            let live = self.service_ids.lookup(&frontend) == Some(u32::from(value.rev_nat_id))
                && self
                    .programmed
                    .get(&frontend)
                    .is_none_or(|p| usize::from(key.backend_slot) <= p.slots.len());
            if !live {
                services.push(key);
            }
        })?;
        let mut backends = Vec::new();
        self.maps.dump_backend(&mut |id, _| {
            if !self.backend_ids.contains_id(id) {
                backends.push(id);
            }
        })?;
        let mut rev_nats = Vec::new();
        self.maps.dump_rev_nat(&mut |key, _| {
            let key = key.to_host();
            if !self.service_ids.contains_id(u32::from(key.id)) {
                rev_nats.push(key);
            }
        })?;
        let mut affinity = Vec::new();
        self.maps.dump_affinity_match(&mut |key| {
            let key = key.to_host();
            let live = self
                .service_ids
                .key_of(u32::from(key.rev_nat_id))
                .is_some_and(|fe| {
                    self.programmed
                        .get(fe)
                        .is_none_or(|p| p.affinity.contains(&key))
                });
            if !live {
                affinity.push(key);
            }
        })?;
        let mut source_ranges = Vec::new();
        self.maps.dump_source_range(&mut |key| {
            let key = key.to_host();
            let live = self
                .service_ids
                .key_of(u32::from(key.rev_nat_id))
                .is_some_and(|fe| {
                    self.programmed
                        .get(fe)
                        .is_none_or(|p| p.source_ranges.contains(&key))
                });
            if !live {
                source_ranges.push(key);
            }
        })?;

        let removed = services.len()
            + backends.len()
            + rev_nats.len()
            + affinity.len()
            + source_ranges.len();
        for key in services {
            self.map_op(SERVICE_MAP, |m| m.delete_service(key.to_network()))?;
        }
        for id in backends {
            self.map_op(BACKEND_MAP, |m| m.delete_backend(id))?;
        }
        for key in rev_nats {
            self.map_op(REV_NAT_MAP, |m| m.delete_rev_nat(key.to_network()))?;
        }
        for key in affinity {
            self.map_op(AFFINITY_MATCH_MAP, |m| m.delete_affinity_match(key.to_network()))?;
        }
        for key in source_ranges {
            self.map_op(SOURCE_RANGE_MAP, |m| m.delete_source_range(key.to_network()))?;
        }

        if removed > 0 || !unclaimed.is_empty() || !unreferenced.is_empty() {
            info!(
                entries = removed,
                services = unclaimed.len(),
                backends = unreferenced.len(),
                "pruned orphaned datapath state"
            );
        }
        Ok(())
    }
}

/// Active wins over quarantined. Terminating backends are never selected.
fn merged_state(states: impl Iterator<Item = BackendState>) -> Option<BackendState> {
    states.fold(None, |best, state| match (best, state) {
        (Some(BackendState::Active), _) | (_, BackendState::Active) => Some(BackendState::Active),
        (Some(best), _) => Some(best),
        (None, state) => Some(state),
    })
}

fn slot_number(index: usize) -> LbResult<u16> {
    u16::try_from(index + 1)
        .map_err(|_| LbError::InvariantViolation(format!("backend slot {} out of range", index + 1)))
}

impl Operations<Frontend> for BpfOps {
    type Error = LbError;

    fn update(&mut self, txn: &ReadTxn, fe: &Frontend) -> LbResult<()> {
        self.update_frontend(txn, fe)
    }

    fn delete(&mut self, _txn: &ReadTxn, fe: &Frontend) -> LbResult<()> {
        self.delete_frontend(fe)
    }

    fn prune(
        &mut self,
        _txn: &ReadTxn,
        frontends: &mut dyn Iterator<Item = &Frontend>,
    ) -> LbResult<()> {
        self.prune_maps(frontends)
    }

    fn is_retryable(&self, error: &LbError) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::maps::MemoryLbMaps;

    fn ops_with(maps: Arc<MemoryLbMaps>) -> BpfOps {
        let db = warplb_statedb::Db::new();
        let tables = LbTables::register(&db).unwrap();
        BpfOps::new(maps, tables, &LbConfig::default()).unwrap()
    }

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn restores_ids_from_existing_entries() {
        let maps = Arc::new(MemoryLbMaps::new());
        let frontend = L3n4Addr::tcp(v4(1), 80);
        let backend = L3n4Addr::tcp(v4(2), 8080);
        maps.update_backend(7, BackendValue::new(&backend, BackendState::Active).to_network())
            .unwrap();
        let master = ServiceValue {
            rev_nat_id: 3,
            ..ServiceValue::default()
        };
        maps.update_service(ServiceKey::new(&frontend, 0).to_network(), master.to_network())
            .unwrap();

        let ops = ops_with(maps);
        assert_eq!(ops.service_id(&frontend), Some(3));
        assert_eq!(ops.backend_id(&backend), Some(7));
    }

    #[test]
    fn map_calls_over_the_timeout_fail() {
        let mut ops = ops_with(Arc::new(MemoryLbMaps::new()));
        ops.map_timeout = Duration::from_millis(1);
        let err = ops
            .map_op(SERVICE_MAP, |_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            LbError::MapOperationFailed(MapError::Timeout { map: "service", .. })
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn merged_state_prefers_active() {
        use BackendState::{Active, Quarantined};
        assert_eq!(merged_state([].into_iter()), None);
        assert_eq!(merged_state([Quarantined].into_iter()), Some(Quarantined));
        assert_eq!(merged_state([Quarantined, Active].into_iter()), Some(Active));
        assert_eq!(merged_state([Active, Quarantined].into_iter()), Some(Active));
    }

    #[test]
    fn slot_numbers_start_at_one() {
        assert_eq!(slot_number(0).unwrap(), 1);
        assert!(slot_number(usize::from(u16::MAX)).is_err());
    }
}
