//! Upstream change events.
//!
//! A reflector translating platform resources into table writes hands the
//! [`Writer`](crate::Writer) one [`Event`] per changed object. Each event
//! carries a completion callback that receives the outcome once the event
//! has been applied (or rejected).

use std::fmt;

use crate::error::LbError;
use crate::tables::{BackendParams, FrontendParams, Service};
use crate::types::ServiceName;

/// Completion callback: `None` on success.
pub type DoneFn = Box<dyn FnOnce(Option<&LbError>) + Send>;

pub enum EventKind<T> {
    Upsert(T),
    Delete,
}

/// A keyed upsert or delete of an upstream object.
pub struct Event<T> {
    pub key: ServiceName,
    pub kind: EventKind<T>,
    done: Option<DoneFn>,
}

impl<T> Event<T> {
    pub fn upsert(key: ServiceName, object: T) -> Self {
        Self {
            key,
            kind: EventKind::Upsert(object),
            done: None,
        }
    }

    pub fn delete(key: ServiceName) -> Self {
        Self {
            key,
            kind: EventKind::Delete,
            done: None,
        }
    }

    pub fn with_done(mut self, done: impl FnOnce(Option<&LbError>) + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    /// Split into the payload and the completion callback.
    pub(crate) fn into_parts(self) -> (ServiceName, EventKind<T>, Option<DoneFn>) {
        (self.key, self.kind, self.done)
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EventKind::Upsert(_) => "upsert",
            EventKind::Delete => "delete",
        };
        f.debug_struct("Event")
            .field("key", &self.key)
            .field("kind", &kind)
            .finish()
    }
}

/// Complete desired state of one service: the service row, every frontend
/// and every backend. Applying it replaces whatever the tables held for
/// the service.
#[derive(Debug, Clone)]
pub struct ServiceSync {
    pub service: Service,
    pub frontends: Vec<FrontendParams>,
    pub backends: Vec<BackendParams>,
}
