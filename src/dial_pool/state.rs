// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::Arc;

use crate::dial_pool::types::Notification;
use crate::error::Error;

/// The coarse status of a key's entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// A dial for the key is outstanding.
    Opening,
    /// The key holds a live connection.
    Established,
    /// The last dial failed or the pool was shut down.
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Opening => fmt.write_str("opening"),
            Status::Established => fmt.write_str("established"),
            Status::Failed => fmt.write_str("failed"),
        }
    }
}

/// What a request for a key returns: the shared connection, or the error the
/// key resolved to.
pub type Outcome<C, E> = Result<Arc<C>, Error<E>>;

// The per-key state machine. A state leaves `Opening` exactly once, and the
// notification it held is signaled with the new outcome on the way out.
#[doc(hidden)]
pub enum ConnectionState<C, E> {
    Opening(Notification<Outcome<C, E>>),
    Established(Arc<C>),
    Failed(Error<E>),
}

impl<C, E> ConnectionState<C, E> {
    pub fn status(&self) -> Status {
        match self {
            ConnectionState::Opening(_) => Status::Opening,
            ConnectionState::Established(_) => Status::Established,
            ConnectionState::Failed(_) => Status::Failed,
        }
    }

    /// Move the state to `next`. If the state was `Opening`, its notification
    /// is signaled so that every waiter wakes up and observes `next`.
    pub fn resolve(&mut self, next: ConnectionState<C, E>) {
        let prev = std::mem::replace(self, next);
        if let ConnectionState::Opening(notification) = prev {
            if let Some(outcome) = self.outcome() {
                notification.notify(outcome);
            }
        }
    }

    /// The value a request returns for this state, or `None` while the state
    /// is still opening.
    pub fn outcome(&self) -> Option<Outcome<C, E>> {
        match self {
            ConnectionState::Opening(_) => None,
            ConnectionState::Established(conn) => Some(Ok(Arc::clone(conn))),
            ConnectionState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

impl<C, E> fmt::Debug for ConnectionState<C, E> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("ConnectionState").field(&self.status()).finish()
    }
}

// A map entry: the state plus the epoch it was created in. The epoch lets the
// dial thread and the creating request recognise their own entry.
#[doc(hidden)]
#[derive(Debug)]
pub struct Entry<C, E> {
    pub epoch: u64,
    pub state: ConnectionState<C, E>,
}
