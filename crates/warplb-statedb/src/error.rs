//! Error types for the table store.

use thiserror::Error;

use crate::db::Revision;

/// Result type alias for table store operations.
pub type StateDbResult<T> = Result<T, StateDbError>;

/// Errors that can occur while registering tables or mutating them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateDbError {
    #[error("table already registered: {0}")]
    TableExists(String),

    #[error("table {0} is not locked by this write transaction")]
    TableNotLocked(String),

    #[error("table {0} is not registered with this database")]
    TableNotRegistered(String),

    #[error("unknown index {index} on table {table}")]
    UnknownIndex { table: String, index: String },

    #[error("revision mismatch in table {table}: expected {expected}, found {found:?}")]
    RevisionMismatch {
        table: String,
        expected: Revision,
        found: Option<Revision>,
    },
}
