//! The Writer, the only way load-balancing tables are modified.
//!
//! Every public operation commits exactly one transaction spanning the
//! service, frontend, backend and node-address tables, so readers never see
//! a frontend whose backends are half written. The `*_in` variants take an
//! open transaction for callers composing several operations via
//! [`Writer::transaction`].
//!
//! Invariants maintained on every commit:
//! - a backend row exists exactly as long as it has at least one instance;
//! - a frontend address is owned by at most one service;
//! - a frontend's backend list only names existing backend rows with an
//!   instance for the frontend's service.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use warplb_statedb::{Db, ReadTxn, ReadView, Table, WriteTxn};

use crate::config::LbConfig;
use crate::dump;
use crate::error::{LbError, LbResult};
use crate::events::{Event, EventKind, ServiceSync};
use crate::tables::{
    Backend, BackendParams, Frontend, FrontendParams, LbTables, NodeAddress, SERVICE_INDEX,
    Service, service_key,
};
use crate::types::{L3n4Addr, ServiceName, SvcType, TrafficPolicy};

pub struct Writer {
    db: Db,
    tables: LbTables,
    node_port_range: RangeInclusive<u16>,
    ext_traffic_policy: TrafficPolicy,
    int_traffic_policy: TrafficPolicy,
}

impl Writer {
    pub fn new(db: Db, tables: LbTables, config: &LbConfig) -> Self {
        let lb = &config.loadbalancer;
        Self {
            db,
            tables,
            node_port_range: lb.node_port_min..=lb.node_port_max,
            ext_traffic_policy: lb.ext_traffic_policy,
            int_traffic_policy: lb.int_traffic_policy,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn tables(&self) -> &LbTables {
        &self.tables
    }

    pub fn services(&self) -> &Table<Service> {
        &self.tables.services
    }

    pub fn frontends(&self) -> &Table<Frontend> {
        &self.tables.frontends
    }

    pub fn backends(&self) -> &Table<Backend> {
        &self.tables.backends
    }

    pub fn node_addresses(&self) -> &Table<NodeAddress> {
        &self.tables.node_addresses
    }

    pub fn read_txn(&self) -> ReadTxn {
        self.db.read_txn()
    }

    /// A service with the configured default traffic policies.
    pub fn new_service(&self, name: ServiceName, source: impl Into<String>) -> Service {
        let mut service = Service::new(name, source);
        service.ext_traffic_policy = self.ext_traffic_policy;
        service.int_traffic_policy = self.int_traffic_policy;
        service
    }

    /// Lock all load-balancing tables for writing.
    pub fn write_txn(&self) -> WriteTxn {
        self.db.write_txn(&[
            &self.tables.services,
            &self.tables.frontends,
            &self.tables.backends,
            &self.tables.node_addresses,
        ])
    }

    /// Run `f` in one transaction; commit on `Ok`, discard everything on
    /// `Err`.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut WriteTxn) -> LbResult<R>) -> LbResult<R> {
        let mut txn = self.write_txn();
        let out = f(&mut txn)?;
        txn.commit();
        Ok(out)
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn upsert_service(&self, service: Service) -> LbResult<()> {
        self.transaction(|txn| self.upsert_service_in(txn, service))
    }

    /// Insert or replace a service. A changed service marks its frontends
    /// pending, as policies and affinity affect what gets programmed.
    pub fn upsert_service_in(&self, txn: &mut WriteTxn, service: Service) -> LbResult<()> {
        let existing = self
            .tables
            .services
            .get(&*txn, &service.name)
            .map(|o| o.data().clone());
        if existing.as_deref() == Some(&service) {
            return Ok(());
        }

        let name = service.name.clone();
        self.tables.services.insert(txn, service)?;
        debug!(service = %name, "service upserted");
        if existing.is_some() {
            self.refresh_frontends_in(txn, &name, true)?;
        }
        Ok(())
    }

    /// Delete a service with all its frontends and backend instances.
    /// Returns whether anything was removed.
    pub fn delete_service(&self, name: &ServiceName) -> LbResult<bool> {
        self.transaction(|txn| self.delete_service_in(txn, name))
    }

    pub fn delete_service_in(&self, txn: &mut WriteTxn, name: &ServiceName) -> LbResult<bool> {
        let frontends = self.frontends_of(txn, name)?;
        for addr in &frontends {
            self.tables.frontends.delete(txn, addr)?;
        }
        let backends = self.backend_addrs_of(txn, name)?;
        self.remove_instances_in(txn, name, &backends)?;
        let existed = self.tables.services.delete(txn, name)?.is_some();

        let removed = existed || !frontends.is_empty() || !backends.is_empty();
        if removed {
            debug!(service = %name, frontends = frontends.len(), backends = backends.len(), "service deleted");
        }
        Ok(removed)
    }

    // ── Frontends ──────────────────────────────────────────────────

    /// Create or update a frontend and add `backends` to its service.
    ///
    /// Fails with [`LbError::AddressConflict`] if another service owns the
    /// address, and [`LbError::ServiceNotFound`] if the service does not
    /// exist.
    pub fn upsert_frontend(&self, params: FrontendParams, backends: &[BackendParams]) -> LbResult<()> {
        self.transaction(|txn| self.upsert_frontend_in(txn, params, backends))
    }

    pub fn upsert_frontend_in(
        &self,
        txn: &mut WriteTxn,
        params: FrontendParams,
        backends: &[BackendParams],
    ) -> LbResult<()> {
        self.check_frontend(txn, &params)?;
        let service = params.service_name.clone();
        let backends_changed = self.put_backends_in(txn, &service, backends)?;
        self.put_frontend_in(txn, params, false)?;
        if backends_changed {
            self.refresh_frontends_in(txn, &service, false)?;
        }
        Ok(())
    }

    /// Delete a frontend. Backend instances of its service are removed from
    /// backends no other frontend of the service selects; the service itself
    /// goes with its last frontend. Returns whether the frontend existed.
    pub fn delete_frontend(&self, address: &L3n4Addr) -> LbResult<bool> {
        self.transaction(|txn| self.delete_frontend_in(txn, address))
    }

    pub fn delete_frontend_in(&self, txn: &mut WriteTxn, address: &L3n4Addr) -> LbResult<bool> {
        let Some(fe) = self.tables.frontends.delete(txn, address)? else {
            return Ok(false);
        };
        let service = &fe.service_name;
        debug!(%address, %service, "frontend deleted");

        let remaining = self.frontends_of(txn, service)?;
        if remaining.is_empty() {
            let backends = self.backend_addrs_of(txn, service)?;
            self.remove_instances_in(txn, service, &backends)?;
            self.tables.services.delete(txn, service)?;
            debug!(%service, "service deleted with its last frontend");
            return Ok(true);
        }

        let needed: BTreeSet<L3n4Addr> = remaining
            .iter()
            .filter_map(|addr| self.tables.frontends.get(&*txn, addr))
            .flat_map(|other| other.backends.iter().copied())
            .collect();
        let orphaned: Vec<L3n4Addr> = fe
            .backends
            .iter()
            .filter(|addr| !needed.contains(addr))
            .copied()
            .collect();
        self.remove_instances_in(txn, service, &orphaned)?;
        Ok(true)
    }

    // ── Backends ───────────────────────────────────────────────────

    /// Add or update backend instances of a service.
    pub fn upsert_backends(&self, service: &ServiceName, backends: &[BackendParams]) -> LbResult<()> {
        self.transaction(|txn| self.upsert_backends_in(txn, service, backends))
    }

    pub fn upsert_backends_in(
        &self,
        txn: &mut WriteTxn,
        service: &ServiceName,
        backends: &[BackendParams],
    ) -> LbResult<()> {
        if self.put_backends_in(txn, service, backends)? {
            self.refresh_frontends_in(txn, service, false)?;
        }
        Ok(())
    }

    /// Remove a service's instances from the given backends. Backends left
    /// without instances are deleted.
    pub fn delete_backends(&self, service: &ServiceName, addresses: &[L3n4Addr]) -> LbResult<()> {
        self.transaction(|txn| self.delete_backends_in(txn, service, addresses))
    }

    pub fn delete_backends_in(
        &self,
        txn: &mut WriteTxn,
        service: &ServiceName,
        addresses: &[L3n4Addr],
    ) -> LbResult<()> {
        if self.remove_instances_in(txn, service, addresses)? {
            self.refresh_frontends_in(txn, service, false)?;
        }
        Ok(())
    }

    // ── Node addresses ─────────────────────────────────────────────

    /// Replace the node's addresses. On change, NodePort frontends are marked
    /// pending so they are re-expanded.
    pub fn set_node_addresses(&self, addresses: Vec<NodeAddress>) -> LbResult<()> {
        self.transaction(|txn| {
            let wanted: BTreeMap<_, _> = addresses.into_iter().map(|a| (a.addr, a)).collect();
            let current: Vec<NodeAddress> = self
                .tables
                .node_addresses
                .all(&*txn)
                .map(|o| NodeAddress::clone(o))
                .collect();
            if current.iter().eq(wanted.values()) {
                return Ok(());
            }

            for addr in current.iter().map(|a| a.addr) {
                self.tables.node_addresses.delete(txn, &addr)?;
            }
            for addr in wanted.into_values() {
                self.tables.node_addresses.insert(txn, addr)?;
            }

            let surrogates: Vec<FrontendParams> = self
                .tables
                .frontends
                .all(&*txn)
                .filter(|fe| fe.is_node_port_surrogate())
                .map(|fe| fe.params())
                .collect();
            info!(frontends = surrogates.len(), "node addresses changed");
            for params in surrogates {
                self.put_frontend_in(txn, params, true)?;
            }
            Ok(())
        })
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Apply one upstream service event and report the outcome to its
    /// completion callback.
    pub fn apply_service_event(&self, event: Event<ServiceSync>) -> LbResult<()> {
        let (key, kind, done) = event.into_parts();
        let result = match kind {
            EventKind::Upsert(sync) => {
                if sync.service.name != key {
                    Err(LbError::InvariantViolation(format!(
                        "event key {key} does not match service {}",
                        sync.service.name
                    )))
                } else {
                    self.transaction(|txn| self.sync_service_in(txn, sync))
                }
            }
            EventKind::Delete => self.transaction(|txn| self.delete_service_in(txn, &key).map(|_| ())),
        };

        if let Err(e) = &result {
            warn!(service = %key, error = %e, "service event rejected");
        }
        if let Some(done) = done {
            done(result.as_ref().err());
        }
        result
    }

    /// Make the tables hold exactly `sync` for its service.
    pub fn sync_service_in(&self, txn: &mut WriteTxn, sync: ServiceSync) -> LbResult<()> {
        let name = sync.service.name.clone();
        for params in &sync.frontends {
            if params.service_name != name {
                return Err(LbError::InvalidFrontend {
                    address: params.address,
                    reason: format!("belongs to {}, not {name}", params.service_name),
                });
            }
        }

        self.upsert_service_in(txn, sync.service)?;

        let wanted: BTreeSet<L3n4Addr> = sync.frontends.iter().map(|f| f.address).collect();
        for addr in self.frontends_of(txn, &name)? {
            if !wanted.contains(&addr) {
                self.tables.frontends.delete(txn, &addr)?;
                debug!(address = %addr, service = %name, "stale frontend removed");
            }
        }

        let wanted: BTreeSet<L3n4Addr> = sync.backends.iter().map(|b| b.address).collect();
        let stale: Vec<L3n4Addr> = self
            .backend_addrs_of(txn, &name)?
            .into_iter()
            .filter(|addr| !wanted.contains(addr))
            .collect();
        let removed = self.remove_instances_in(txn, &name, &stale)?;
        let added = self.put_backends_in(txn, &name, &sync.backends)?;

        for params in sync.frontends {
            self.check_frontend(txn, &params)?;
            self.put_frontend_in(txn, params, false)?;
        }
        if removed || added {
            self.refresh_frontends_in(txn, &name, false)?;
        }
        Ok(())
    }

    /// Consume events until the channel closes or `shutdown` fires. An event
    /// being applied always completes first.
    ///
    /// Applying an event may wait on table locks, so it runs under
    /// `block_in_place` and needs the multi-threaded runtime.
    pub async fn run_events(
        &self,
        mut events: mpsc::Receiver<Event<ServiceSync>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("writer event loop started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let key = event.key.clone();
                        if let Err(e) = tokio::task::block_in_place(|| self.apply_service_event(event)) {
                            warn!(service = %key, error = %e, "event loop skipped failed event");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("writer event loop stopped");
    }

    // ── Diagnostics ────────────────────────────────────────────────

    /// Render all tables as text.
    pub fn debug_dump(&self, txn: &dyn ReadView) -> String {
        dump::dump_tables(&self.tables, txn)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn check_frontend(&self, txn: &WriteTxn, params: &FrontendParams) -> LbResult<()> {
        if params.svc_type == SvcType::NodePort && !self.node_port_range.contains(&params.address.port) {
            return Err(LbError::InvalidFrontend {
                address: params.address,
                reason: format!(
                    "node port {} outside {}-{}",
                    params.address.port,
                    self.node_port_range.start(),
                    self.node_port_range.end()
                ),
            });
        }
        if self.tables.services.get(txn, &params.service_name).is_none() {
            return Err(LbError::ServiceNotFound(params.service_name.clone()));
        }
        if let Some(existing) = self.tables.frontends.get(txn, &params.address) {
            if existing.service_name != params.service_name {
                return Err(LbError::AddressConflict {
                    address: params.address,
                    owner: existing.service_name.clone(),
                    requested: params.service_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Write a frontend with freshly selected backends. Unless `force`d,
    /// an unchanged frontend is left untouched. Returns whether it was
    /// written.
    fn put_frontend_in(&self, txn: &mut WriteTxn, params: FrontendParams, force: bool) -> LbResult<bool> {
        let backends = self.select_backends(txn, &params.service_name, &params.port_name)?;
        let fe = Frontend::new(params, backends);
        if !force {
            if let Some(existing) = self.tables.frontends.get(&*txn, &fe.address) {
                if existing.same_desired(&fe) {
                    return Ok(false);
                }
            }
        }
        debug!(address = %fe.address, service = %fe.service_name, backends = fe.backends.len(), "frontend upserted");
        self.tables.frontends.insert(txn, fe)?;
        Ok(true)
    }

    fn refresh_frontends_in(&self, txn: &mut WriteTxn, service: &ServiceName, force: bool) -> LbResult<()> {
        let params: Vec<FrontendParams> = self
            .tables
            .frontends
            .list(&*txn, SERVICE_INDEX, &service_key(service))?
            .map(|fe| fe.params())
            .collect();
        for p in params {
            self.put_frontend_in(txn, p, force)?;
        }
        Ok(())
    }

    /// Backends of `service` whose instance port name matches, in address
    /// order.
    fn select_backends(&self, txn: &WriteTxn, service: &ServiceName, port_name: &str) -> LbResult<Vec<L3n4Addr>> {
        Ok(self
            .tables
            .backends
            .list(txn, SERVICE_INDEX, &service_key(service))?
            .filter(|be| {
                be.instance(service).is_some_and(|inst| {
                    port_name.is_empty() || inst.port_name.is_empty() || inst.port_name == port_name
                })
            })
            .map(|be| be.address)
            .collect())
    }

    fn put_backends_in(&self, txn: &mut WriteTxn, service: &ServiceName, backends: &[BackendParams]) -> LbResult<bool> {
        let mut changed = false;
        for params in backends {
            let existing = self
                .tables
                .backends
                .get(&*txn, &params.address)
                .map(|o| o.data().clone());
            let mut be = match &existing {
                Some(be) => Backend::clone(be),
                None => Backend {
                    address: params.address,
                    node_name: String::new(),
                    instances: BTreeMap::new(),
                },
            };
            be.node_name = params.node_name.clone();
            be.instances.insert(service.clone(), params.instance());
            if existing.as_deref() == Some(&be) {
                continue;
            }
            debug!(address = %params.address, %service, state = %params.state, "backend upserted");
            self.tables.backends.insert(txn, be)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Returns whether any backend changed.
    fn remove_instances_in(&self, txn: &mut WriteTxn, service: &ServiceName, addresses: &[L3n4Addr]) -> LbResult<bool> {
        let mut changed = false;
        for addr in addresses {
            let Some(be) = self.tables.backends.get(&*txn, addr) else {
                continue;
            };
            if be.instance(service).is_none() {
                continue;
            }
            let mut be = Backend::clone(be);
            be.instances.remove(service);
            if be.instances.is_empty() {
                self.tables.backends.delete(txn, addr)?;
                debug!(address = %addr, "backend deleted with its last instance");
            } else {
                self.tables.backends.insert(txn, be)?;
                debug!(address = %addr, %service, "backend instance removed");
            }
            changed = true;
        }
        Ok(changed)
    }

    fn frontends_of(&self, txn: &WriteTxn, service: &ServiceName) -> LbResult<Vec<L3n4Addr>> {
        Ok(self
            .tables
            .frontends
            .list(txn, SERVICE_INDEX, &service_key(service))?
            .map(|fe| fe.address)
            .collect())
    }

    fn backend_addrs_of(&self, txn: &WriteTxn, service: &ServiceName) -> LbResult<Vec<L3n4Addr>> {
        Ok(self
            .tables
            .backends
            .list(txn, SERVICE_INDEX, &service_key(service))?
            .map(|be| be.address)
            .collect())
    }
}
