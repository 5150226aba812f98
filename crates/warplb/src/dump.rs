//! Text and JSON renderings of the tables and the datapath maps, for
//! debugging and for comparing state in tests.

use std::fmt::Write as _;

use serde_json::{Value, json};
use warplb_statedb::ReadView;

use crate::error::MapError;
use crate::maps::{ByteOrder, LbMaps};
use crate::tables::LbTables;
use crate::types::{L3n4Addr, L4Type, Scope};

/// Every map entry as one line, sorted.
///
/// With `sanitize` set, service, backend and reverse NAT IDs render as
/// `<zero>` or `<non-zero>`, so dumps taken under different allocation
/// orders compare equal.
pub fn dump_lb_maps(maps: &dyn LbMaps, sanitize: bool) -> Result<Vec<String>, MapError> {
    let id = |n: u32| -> String {
        if !sanitize {
            n.to_string()
        } else if n == 0 {
            "<zero>".to_string()
        } else {
            "<non-zero>".to_string()
        }
    };
    let mut lines = Vec::new();

    maps.dump_service(&mut |key, value| {
        let (key, value) = (key.to_host(), value.to_host());
        lines.push(format!(
            "SVC: ID={} ADDR={} SLOT={} BEID={} COUNT={} QCOUNT={} FLAGS={}",
            id(u32::from(value.rev_nat_id)),
            key.frontend(),
            key.backend_slot,
            id(value.backend_id),
            value.count,
            value.qcount,
            value.flags,
        ));
    })?;
    maps.dump_backend(&mut |backend_id, value| {
        let value = value.to_host();
        let state = value
            .state()
            .map_or_else(|| format!("unknown({})", value.flags), |s| s.to_string());
        lines.push(format!(
            "BE: ID={} ADDR={} STATE={}",
            id(backend_id),
            value.backend(),
            state
        ));
    })?;
    maps.dump_rev_nat(&mut |key, value| {
        let (key, value) = (key.to_host(), value.to_host());
        let addr = L3n4Addr::new(L4Type::Any, value.address, value.port, Scope::External);
        let addr = addr.to_string();
        let addr = addr.strip_suffix("/ANY").unwrap_or(&addr);
        lines.push(format!("REV: ID={} ADDR={}", id(u32::from(key.id)), addr));
    })?;
    maps.dump_affinity_match(&mut |key| {
        let key = key.to_host();
        lines.push(format!(
            "AFF: ID={} BEID={}",
            id(u32::from(key.rev_nat_id)),
            key.backend_id
        ));
    })?;
    maps.dump_source_range(&mut |key| {
        let key = key.to_host();
        lines.push(format!(
            "SRCRANGE: ID={} CIDR={}",
            id(u32::from(key.rev_nat_id)),
            key.cidr
        ));
    })?;

    lines.sort();
    Ok(lines)
}

/// All load-balancing tables as text.
pub fn dump_tables(tables: &LbTables, txn: &dyn ReadView) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "--- Services ---");
    for svc in tables.services.all(txn) {
        let _ = writeln!(
            out,
            "{}  source={} ext={} int={} affinity={} ranges={}",
            svc.name,
            svc.source,
            svc.ext_traffic_policy,
            svc.int_traffic_policy,
            svc.session_affinity,
            svc.source_ranges.len(),
        );
    }

    let _ = writeln!(out, "--- Frontends ---");
    for fe in tables.frontends.all(txn) {
        let backends: Vec<String> = fe.backends.iter().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "{}  {}  {}  port={:?}  [{}]  {}",
            fe.address,
            fe.svc_type,
            fe.service_name,
            fe.port_name,
            backends.join(", "),
            fe.status,
        );
    }

    let _ = writeln!(out, "--- Backends ---");
    for be in tables.backends.all(txn) {
        let instances: Vec<String> = be
            .instances
            .iter()
            .map(|(svc, inst)| format!("{svc}:{}:{}", inst.port_name, inst.state))
            .collect();
        let _ = writeln!(
            out,
            "{}  node={:?}  {}",
            be.address,
            be.node_name,
            instances.join(" ")
        );
    }

    let _ = writeln!(out, "--- Node addresses ---");
    for node in tables.node_addresses.all(txn) {
        let _ = writeln!(
            out,
            "{}  nodeport={} primary={} device={}",
            node.addr, node.node_port, node.primary, node.device
        );
    }
    out
}

/// All load-balancing tables as a JSON document.
pub fn tables_json(tables: &LbTables, txn: &dyn ReadView) -> Value {
    let services: Vec<Value> = tables
        .services
        .all(txn)
        .map(|svc| {
            json!({
                "name": svc.name.to_string(),
                "source": svc.source,
                "ext_traffic_policy": svc.ext_traffic_policy,
                "int_traffic_policy": svc.int_traffic_policy,
                "session_affinity": svc.session_affinity,
                "source_ranges": svc.source_ranges.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();
    let frontends: Vec<Value> = tables
        .frontends
        .all(txn)
        .map(|fe| {
            json!({
                "address": fe.address.to_string(),
                "type": fe.svc_type.to_string(),
                "service": fe.service_name.to_string(),
                "port_name": fe.port_name,
                "backends": fe.backends.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "status": fe.status.kind.to_string(),
                "error": fe.status.error,
            })
        })
        .collect();
    let backends: Vec<Value> = tables
        .backends
        .all(txn)
        .map(|be| {
            let instances: serde_json::Map<String, Value> = be
                .instances
                .iter()
                .map(|(svc, inst)| {
                    (
                        svc.to_string(),
                        json!({ "port_name": inst.port_name, "state": inst.state }),
                    )
                })
                .collect();
            json!({
                "address": be.address.to_string(),
                "node_name": be.node_name,
                "instances": instances,
            })
        })
        .collect();

    json!({
        "services": services,
        "frontends": frontends,
        "backends": backends,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{
        BackendValue, MemoryLbMaps, RevNatKey, RevNatValue, ServiceFlags, ServiceKey,
        ServiceValue,
    };
    use crate::types::{BackendState, SvcType};

    #[test]
    fn renders_sorted_and_sanitized_lines() {
        let maps = MemoryLbMaps::new();
        let frontend: L3n4Addr = "10.0.0.1:80/TCP".parse().unwrap();
        let backend: L3n4Addr = "10.1.0.1:8080/TCP".parse().unwrap();
        maps.update_backend(4, BackendValue::new(&backend, BackendState::Active).to_network())
            .unwrap();
        let master = ServiceValue {
            count: 1,
            rev_nat_id: 2,
            flags: ServiceFlags::new(SvcType::ClusterIP),
            ..ServiceValue::default()
        };
        maps.update_service(ServiceKey::new(&frontend, 0).to_network(), master.to_network())
            .unwrap();
        maps.update_rev_nat(
            RevNatKey { id: 2 }.to_network(),
            RevNatValue {
                address: frontend.ip(),
                port: 80,
            }
            .to_network(),
        )
        .unwrap();

        let lines = dump_lb_maps(&maps, false).unwrap();
        assert_eq!(
            lines,
            vec![
                "BE: ID=4 ADDR=10.1.0.1:8080/TCP STATE=active",
                "REV: ID=2 ADDR=10.0.0.1:80",
                "SVC: ID=2 ADDR=10.0.0.1:80/TCP SLOT=0 BEID=0 COUNT=1 QCOUNT=0 FLAGS=ClusterIP+non-routable",
            ]
        );

        let sanitized = dump_lb_maps(&maps, true).unwrap();
        assert_eq!(sanitized[0], "BE: ID=<non-zero> ADDR=10.1.0.1:8080/TCP STATE=active");
        assert!(sanitized[2].contains("BEID=<zero>"));
    }
}
