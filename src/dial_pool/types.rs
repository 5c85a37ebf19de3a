// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::dial_pool::state::Entry;

/// The entry and dial counts for a dial pool
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DialPoolStats {
    /// Keys with a dial outstanding
    pub opening: ConnectionCount,
    /// Keys holding a live connection
    pub established: ConnectionCount,
    /// Keys whose last dial failed and that have not been pruned yet
    pub failed: ConnectionCount,
    /// Dial threads that have not finished yet. This can exceed `opening`
    /// when a dial lost a race to an injection and is still running.
    pub dials_in_flight: DialCount,
}

impl DialPoolStats {
    /// Create a new instance of `DialPoolStats` with every count at zero
    pub fn new() -> Self {
        DialPoolStats {
            opening: ConnectionCount::from(0),
            established: ConnectionCount::from(0),
            failed: ConnectionCount::from(0),
            dials_in_flight: DialCount::from(0),
        }
    }
}

impl Default for DialPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a dial pool. Every field is optional;
/// `DialPoolOptions::default()` is a working configuration.
#[derive(Clone, Debug, Default)]
pub struct DialPoolOptions {
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// An optional name for the threads that run the dialer. The default is
    /// `dialpool-dial`.
    pub dial_thread_name: Option<String>,
    /// An optional number of keys to reserve room for up front. The default
    /// is 16.
    pub initial_capacity: Option<usize>,
}

/// A newtype wrapper around u32 used for counts of pool entries.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A newtype wrapper around u32 used for counts of running dial threads.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct DialCount(u32);

/// Sum type representing the current state of the dial pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool is running and servicing requests.
    Running,
    /// The pool has been shut down and rejects every operation.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Running => fmt.write_str("running"),
            PoolState::Stopped => fmt.write_str("stopped"),
        }
    }
}

/// A one-shot broadcast signal carrying a value.
///
/// Every clone shares the same slot. `notify` stores the value and wakes all
/// current waiters; later `wait` calls return a clone of it immediately. The
/// slot is never cleared.
#[derive(Debug)]
pub struct Notification<T>(Arc<(Mutex<Option<T>>, Condvar)>);

impl<T> Notification<T> {
    pub fn new() -> Self {
        Notification(Arc::new((Mutex::new(None), Condvar::new())))
    }

    /// Store `value` and wake every waiter. Returns `false` if the
    /// notification had already been signaled, in which case `value` is
    /// dropped.
    pub fn notify(&self, value: T) -> bool {
        let mut slot = lock(&(self.0).0);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        (self.0).1.notify_all();
        true
    }

    pub fn is_notified(&self) -> bool {
        lock(&(self.0).0).is_some()
    }
}

impl<T> Notification<T>
where
    T: Clone,
{
    /// Block until `notify` has been called on any clone, then return the
    /// value it was given.
    pub fn wait(&self) -> T {
        let mut slot = lock(&(self.0).0);
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = (self.0)
                .1
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> Default for Notification<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Notification<T> {
    fn clone(&self) -> Notification<T> {
        Notification(Arc::clone(&self.0))
    }
}

// Counts the dial threads that are still running so that shutdown can wait
// for all of them.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct DialTracker {
    running: Mutex<u32>,
    idle: Condvar,
}

impl DialTracker {
    pub fn new() -> Self {
        DialTracker {
            running: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub fn add(&self) {
        *lock(&self.running) += 1;
    }

    pub fn done(&self) {
        let mut running = lock(&self.running);
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.idle.notify_all();
        }
    }

    pub fn in_flight(&self) -> DialCount {
        DialCount::from(*lock(&self.running))
    }

    /// Block until no dial thread is running.
    pub fn wait_idle(&self) {
        let mut running = lock(&self.running);
        while *running > 0 {
            running = self
                .idle
                .wait(running)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// The internal data structures used to manage the dial pool. All of it is
// guarded by the single mutex in `ProtectedData`.
#[doc(hidden)]
#[derive(Debug)]
pub struct PoolData<K, C, E> {
    pub entries: HashMap<K, Entry<C, E>>,
    pub closed: bool,
    pub next_epoch: u64,
}

impl<K, C, E> PoolData<K, C, E>
where
    K: Eq + std::hash::Hash,
{
    #[doc(hidden)]
    pub fn new(capacity: usize) -> Self {
        PoolData {
            entries: HashMap::with_capacity(capacity),
            closed: false,
            next_epoch: 0,
        }
    }

    pub fn take_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }
}

// Protected access to the internal dial pool data structures
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<K, C, E>(Mutex<PoolData<K, C, E>>);

impl<K, C, E> ProtectedData<K, C, E> {
    pub fn new(pool_data: PoolData<K, C, E>) -> Self {
        ProtectedData(Mutex::new(pool_data))
    }

    pub fn pool_data_lock(&self) -> MutexGuard<PoolData<K, C, E>> {
        lock(&self.0)
    }
}

// Nothing panics while one of these locks is held, so the data behind a
// poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
