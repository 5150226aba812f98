//! Error types for the load-balancer control plane.

use std::time::Duration;

use thiserror::Error;
use warplb_statedb::StateDbError;

use crate::types::{L3n4Addr, ServiceName};

/// Result type alias for load-balancer operations.
pub type LbResult<T> = Result<T, LbError>;

/// Errors from the datapath map layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("{map} map: {reason}")]
    Io { map: &'static str, reason: String },

    #[error("{map} map operation timed out after {elapsed:?}")]
    Timeout { map: &'static str, elapsed: Duration },

    #[error("{map} map: injected failure")]
    Injected { map: &'static str },
}

/// Errors surfaced by the [`Writer`](crate::Writer) and
/// [`BpfOps`](crate::BpfOps).
#[derive(Debug, Error)]
pub enum LbError {
    #[error("frontend {address} is owned by {owner}, cannot assign to {requested}")]
    AddressConflict {
        address: L3n4Addr,
        owner: ServiceName,
        requested: ServiceName,
    },

    #[error("service {0} not found")]
    ServiceNotFound(ServiceName),

    #[error("invalid frontend {address}: {reason}")]
    InvalidFrontend { address: L3n4Addr, reason: String },

    #[error("{kind} ID space exhausted")]
    IdExhausted { kind: &'static str },

    #[error("map operation failed: {0}")]
    MapOperationFailed(#[from] MapError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("state error: {0}")]
    State(#[from] StateDbError),
}

impl LbError {
    /// Whether retrying later can succeed. Writer-side validation errors and
    /// invariant violations are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IdExhausted { .. } | Self::MapOperationFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_failures_and_exhaustion_are_retryable() {
        let timeout = LbError::from(MapError::Timeout {
            map: "service",
            elapsed: Duration::from_secs(2),
        });
        assert!(timeout.is_retryable());
        assert!(LbError::IdExhausted { kind: "backend" }.is_retryable());
        assert!(!LbError::InvariantViolation("dangling backend".into()).is_retryable());
        assert!(!LbError::ServiceNotFound(ServiceName::new("ns", "web")).is_retryable());
    }

    #[test]
    fn messages_name_the_map() {
        let err = LbError::from(MapError::Injected { map: "backend" });
        assert_eq!(err.to_string(), "map operation failed: backend map: injected failure");
    }
}
