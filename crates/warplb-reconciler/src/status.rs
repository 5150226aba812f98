//! Per-object reconciliation status.

use std::fmt;
use std::time::{Duration, SystemTime};

/// Where an object stands in the reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// Desired state changed and has not been applied yet.
    Pending,
    /// Desired state is applied.
    Done,
    /// The last attempt failed; see [`Status::error`].
    Error,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Done => write!(f, "Done"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Reconciliation status carried by every reconciled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    /// When the status was last changed.
    pub updated_at: SystemTime,
    /// Latest failure reason, only set for [`StatusKind::Error`].
    pub error: Option<String>,
    /// When the next retry is scheduled. `None` for non-retryable errors.
    pub retry_at: Option<SystemTime>,
}

impl Status {
    pub fn pending() -> Self {
        Self::with_kind(StatusKind::Pending)
    }

    pub fn done() -> Self {
        Self::with_kind(StatusKind::Done)
    }

    pub fn error(reason: impl Into<String>, retry_at: Option<SystemTime>) -> Self {
        Self {
            error: Some(reason.into()),
            retry_at,
            ..Self::with_kind(StatusKind::Error)
        }
    }

    fn with_kind(kind: StatusKind) -> Self {
        Self {
            kind,
            updated_at: SystemTime::now(),
            error: None,
            retry_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.kind == StatusKind::Pending
    }

    pub fn is_done(&self) -> bool {
        self.kind == StatusKind::Done
    }

    /// Time since the status was last changed.
    pub fn age(&self) -> Duration {
        self.updated_at.elapsed().unwrap_or_default()
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::pending()
    }
}

/// Renders as `Done (3s ago)` or `Error: reason (1s ago)`.
impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(reason) => write!(f, "{}: {} ({}s ago)", self.kind, reason, self.age().as_secs()),
            None => write!(f, "{} ({}s ago)", self.kind, self.age().as_secs()),
        }
    }
}
