// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::hash::Hash;

use crate::connection::Connection;

/// Turns a key into a live connection.
///
/// The pool calls `dial` on its own thread, outside of any pool lock, so an
/// implementation may block on real I/O for as long as it needs to. It may be
/// invoked concurrently for distinct keys, and at most once per key while a
/// previous dial for that key is outstanding.
///
/// Any `Fn(&K) -> Result<C, C::Error>` closure that can be shared across
/// threads is a `Dialer`.
pub trait Dialer<K, C>: Send + Sync + 'static
where
    C: Connection,
{
    fn dial(&self, key: &K) -> Result<C, C::Error>;
}

impl<K, C, F> Dialer<K, C> for F
where
    C: Connection,
    F: Fn(&K) -> Result<C, C::Error> + Send + Sync + 'static,
{
    fn dial(&self, key: &K) -> Result<C, C::Error> {
        self(key)
    }
}

/// The bounds a key must satisfy to be pooled.
///
/// Keys are hashed into the pool's map, cloned into dial threads, and
/// rendered with `Display` in log messages and in
/// [`Error::Established`](../error/enum.Error.html). Integers, strings and
/// socket addresses all qualify.
pub trait DialKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<K> DialKey for K where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static
{
}
