//! Load-balancing domain types: addresses, service names, policies.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An IP address qualified by the cluster it belongs to. Cluster 0 is the
/// local cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddrCluster {
    pub addr: IpAddr,
    pub cluster_id: u32,
}

impl AddrCluster {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr, cluster_id: 0 }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for AddrCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cluster_id == 0 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}@{}", self.addr, self.cluster_id)
        }
    }
}

/// Parses `10.0.0.1` or `10.0.0.1@2`.
impl FromStr for AddrCluster {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, cluster_id) = match s.split_once('@') {
            Some((addr, id)) => (addr, id.parse().map_err(|_| format!("invalid cluster id in {s:?}"))?),
            None => (s, 0),
        };
        let addr = addr
            .parse()
            .map_err(|_| format!("invalid IP address {addr:?}"))?;
        Ok(Self { addr, cluster_id })
    }
}

/// Layer 4 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L4Type {
    Any,
    Tcp,
    Udp,
    Sctp,
}

impl L4Type {
    /// IANA protocol number, as stored in map keys.
    pub fn number(self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Sctp => 132,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Any),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            132 => Some(Self::Sctp),
            _ => None,
        }
    }
}

impl fmt::Display for L4Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "ANY"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Sctp => write!(f, "SCTP"),
        }
    }
}

impl FromStr for L4Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            _ => Err(format!("unknown L4 protocol {s:?}")),
        }
    }
}

/// Whether a frontend is reachable from outside the node or only from
/// within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    External,
    Internal,
}

impl Scope {
    pub fn number(self) -> u8 {
        match self {
            Self::External => 0,
            Self::Internal => 1,
        }
    }

    pub fn from_number(n: u8) -> Self {
        if n == 1 { Self::Internal } else { Self::External }
    }
}

/// IP + port + protocol + scope. Identifies frontends and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct L3n4Addr {
    pub addr: AddrCluster,
    pub port: u16,
    pub protocol: L4Type,
    pub scope: Scope,
}

impl L3n4Addr {
    pub fn new(protocol: L4Type, addr: IpAddr, port: u16, scope: Scope) -> Self {
        Self {
            addr: AddrCluster::new(addr),
            port,
            protocol,
            scope,
        }
    }

    /// Shorthand for an external TCP address.
    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        Self::new(L4Type::Tcp, addr, port, Scope::External)
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.addr
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// The same port, protocol and scope on another IP.
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self {
            addr: AddrCluster {
                addr: ip,
                cluster_id: self.addr.cluster_id,
            },
            ..*self
        }
    }
}

/// Renders as `10.0.0.1:80/TCP`, `[2001::1]:80/UDP`; internal scope adds `/i`.
impl fmt::Display for L3n4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}/{}", self.addr, self.port, self.protocol)?;
        } else {
            write!(f, "{}:{}/{}", self.addr, self.port, self.protocol)?;
        }
        if self.scope == Scope::Internal {
            write!(f, "/i")?;
        }
        Ok(())
    }
}

/// Inverse of `Display`. The protocol defaults to TCP when omitted.
impl FromStr for L3n4Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, scope) = match s.strip_suffix("/i") {
            Some(rest) => (rest, Scope::Internal),
            None => (s, Scope::External),
        };
        let (hostport, protocol) = match rest.rsplit_once('/') {
            Some((hp, proto)) => (hp, proto.parse()?),
            None => (rest, L4Type::Tcp),
        };
        let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
            v6.split_once("]:")
                .ok_or_else(|| format!("invalid address {s:?}"))?
        } else {
            hostport
                .rsplit_once(':')
                .ok_or_else(|| format!("missing port in {s:?}"))?
        };
        let addr: AddrCluster = host.parse()?;
        let port = port.parse().map_err(|_| format!("invalid port in {s:?}"))?;
        Ok(Self {
            addr,
            port,
            protocol,
            scope,
        })
    }
}

/// Namespaced service identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a frontend is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SvcType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalIPs,
    HostPort,
}

impl fmt::Display for SvcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
            Self::ExternalIPs => "ExternalIPs",
            Self::HostPort => "HostPort",
        };
        f.write_str(s)
    }
}

/// Which backends may serve traffic arriving at a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficPolicy {
    /// Any backend in the cluster.
    #[default]
    Cluster,
    /// Only backends on the local node.
    Local,
}

impl fmt::Display for TrafficPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => write!(f, "Cluster"),
            Self::Local => write!(f, "Local"),
        }
    }
}

/// Lifecycle state of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    #[default]
    Active,
    /// Draining: receives no new connections.
    Terminating,
    /// Failing health checks: only used when no active backend is left.
    Quarantined,
}

impl BackendState {
    /// Datapath flag encoding.
    pub fn flags(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Terminating => 1,
            Self::Quarantined => 2,
        }
    }

    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags {
            0 => Some(Self::Active),
            1 => Some(Self::Terminating),
            2 => Some(Self::Quarantined),
            _ => None,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Terminating => write!(f, "terminating"),
            Self::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// An IP prefix. Host bits are cleared on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(format!("prefix length {prefix_len} exceeds {max}"));
        }
        let addr = match addr {
            IpAddr::V4(v4) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V4((u32::from(v4) & mask).into())
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V6((u128::from(v6) & mask).into())
            }
        };
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s:?}"))?;
        let addr = addr.parse().map_err(|_| format!("invalid IP address in {s:?}"))?;
        let len = len.parse().map_err(|_| format!("invalid prefix length in {s:?}"))?;
        Self::new(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l3n4addr_parses_ipv4_and_ipv6() {
        let v4: L3n4Addr = "10.0.0.1:80/TCP".parse().unwrap();
        assert_eq!(v4, L3n4Addr::tcp("10.0.0.1".parse().unwrap(), 80));

        let v6: L3n4Addr = "[2001::1]:53/UDP/i".parse().unwrap();
        assert_eq!(v6.protocol, L4Type::Udp);
        assert_eq!(v6.scope, Scope::Internal);
        assert_eq!(v6.port, 53);
        assert_eq!(v6.to_string(), "[2001::1]:53/UDP/i");
    }

    #[test]
    fn l3n4addr_defaults_to_tcp() {
        let addr: L3n4Addr = "10.1.0.1:8080".parse().unwrap();
        assert_eq!(addr.protocol, L4Type::Tcp);
        assert_eq!(addr.to_string(), "10.1.0.1:8080/TCP");
    }

    #[test]
    fn l3n4addr_rejects_garbage() {
        assert!("10.0.0.1".parse::<L3n4Addr>().is_err());
        assert!("10.0.0.1:http".parse::<L3n4Addr>().is_err());
        assert!("10.0.0.1:80/QUIC".parse::<L3n4Addr>().is_err());
    }

    #[test]
    fn addr_cluster_round_trips_cluster_id() {
        let a: AddrCluster = "10.0.0.1@7".parse().unwrap();
        assert_eq!(a.cluster_id, 7);
        assert_eq!(a.to_string(), "10.0.0.1@7");
    }

    #[test]
    fn cidr_clears_host_bits() {
        let c: Cidr = "10.1.2.3/16".parse().unwrap();
        assert_eq!(c.to_string(), "10.1.0.0/16");
        let c: Cidr = "2001:db8::1/32".parse().unwrap();
        assert_eq!(c.to_string(), "2001:db8::/32");
        let c: Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(c.prefix_len(), 0);
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn backend_state_flags_round_trip() {
        for state in [BackendState::Active, BackendState::Terminating, BackendState::Quarantined] {
            assert_eq!(BackendState::from_flags(state.flags()), Some(state));
        }
    }
}
