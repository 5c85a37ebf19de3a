// Copyright 2020 Joyent, Inc.

pub mod state;
pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::thread;

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::connection::Connection;
use crate::dial_pool::state::{ConnectionState, Entry, Outcome, Status};
use crate::dial_pool::types::{
    ConnectionCount, DialPoolOptions, DialPoolStats, DialTracker,
    Notification, PoolData, PoolState, ProtectedData,
};
use crate::dialer::{DialKey, Dialer};
use crate::error::Error;

// Default name of the threads running the dialer
const DEFAULT_DIAL_THREAD_NAME: &str = "dialpool-dial";
// Default number of keys the pool reserves room for
const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// A keyed pool holding at most one connection per key
///
/// `DialPool` is a cheap handle; clones share the same pool. See the [crate
/// documentation](../index.html) for the guarantees it makes.
pub struct DialPool<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    inner: Arc<Inner<K, C, D>>,
}

struct Inner<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    protected_data: ProtectedData<K, C, C::Error>,
    dial_tracker: DialTracker,
    dialer: D,
    dial_thread_name: String,
    log: Logger,
}

impl<K, C, D> Debug for DialPool<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("DialPool")
            .field("state", &self.get_state())
            .field("dial_thread_name", &self.inner.dial_thread_name)
            .field("dials_in_flight", &self.inner.dial_tracker.in_flight())
            .finish()
    }
}

impl<K, C, D> Clone for DialPool<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    fn clone(&self) -> DialPool<K, C, D> {
        DialPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, C, D> DialPool<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    pub fn new(dpo: DialPoolOptions, dialer: D) -> Self {
        let logger = dpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("component" => "dialpool"));

        let capacity =
            dpo.initial_capacity.unwrap_or(DEFAULT_INITIAL_CAPACITY);
        let dial_thread_name = dpo
            .dial_thread_name
            .unwrap_or_else(|| String::from(DEFAULT_DIAL_THREAD_NAME));

        DialPool {
            inner: Arc::new(Inner {
                protected_data: ProtectedData::new(PoolData::new(capacity)),
                dial_tracker: DialTracker::new(),
                dialer,
                dial_thread_name,
                log: logger,
            }),
        }
    }

    /// Return the connection for `key`, dialing it if the pool has never seen
    /// the key or its last dial failed.
    ///
    /// Concurrent requests for a key share a single dial and all receive the
    /// same `Arc` or the same error. A request blocks only while a dial for its
    /// own key is outstanding. A failed dial is not cached: the request that
    /// started it removes the entry, so the next request dials again.
    pub fn request(&self, key: &K) -> Outcome<C, C::Error> {
        let inner = &self.inner;
        let mut pool_data = inner.protected_data.pool_data_lock();

        if pool_data.closed {
            return Err(Error::Closed);
        }

        let existing = pool_data.entries.get(key).map(|entry| entry.epoch);
        let (epoch, creator) = match existing {
            Some(epoch) => (epoch, false),
            None => {
                let epoch = pool_data.take_epoch();
                pool_data.entries.insert(
                    key.clone(),
                    Entry {
                        epoch,
                        state: ConnectionState::Opening(Notification::new()),
                    },
                );
                spawn_dial(inner, &mut pool_data, key, epoch);
                (epoch, true)
            }
        };

        let pending = match pool_data.entries.get(key).map(|e| &e.state) {
            Some(ConnectionState::Opening(notification)) => {
                Some(notification.clone())
            }
            _ => None,
        };

        let mut notified = None;
        if let Some(notification) = pending {
            drop(pool_data);
            trace!(inner.log, "waiting on dial for key {}", key);
            notified = Some(notification.wait());
            pool_data = inner.protected_data.pool_data_lock();
        }

        // Read the entry this call observed. If another request already
        // pruned it, fall back to the outcome the waiters were woken with.
        let observed = match pool_data.entries.get(key) {
            Some(entry) if entry.epoch == epoch => Some(&entry.state),
            _ => None,
        };
        let failed =
            observed.map(ConnectionState::status) == Some(Status::Failed);
        let outcome = observed
            .and_then(ConnectionState::outcome)
            .or(notified)
            .unwrap_or(Err(Error::DialAborted));

        if creator && failed {
            debug!(
                inner.log,
                "pruning failed entry for key {} (epoch {})", key, epoch
            );
            pool_data.entries.remove(key);
        }

        outcome
    }

    /// Hand the pool a connection for `key` that was established elsewhere.
    ///
    /// If a dial for the key is outstanding, its waiters are resolved with
    /// `conn` and the dial's own result is discarded when it arrives. If the
    /// key's last dial failed, `conn` replaces the failure. If the key already
    /// holds a live connection the injection is refused with
    /// `Error::Established` and the pool is unchanged.
    pub fn inject(&self, key: K, conn: Arc<C>) -> Result<(), Error<C::Error>> {
        let inner = &self.inner;
        let mut guard = inner.protected_data.pool_data_lock();
        let pool_data = &mut *guard;

        if pool_data.closed {
            return Err(Error::Closed);
        }

        match pool_data.entries.get_mut(&key) {
            Some(entry) => match entry.state.status() {
                Status::Established => {
                    debug!(
                        inner.log,
                        "refusing injection for key {}, already established",
                        key
                    );
                    Err(Error::Established(key.to_string()))
                }
                status => {
                    info!(
                        inner.log,
                        "injected connection for {} key {}", status, key
                    );
                    entry.state.resolve(ConnectionState::Established(conn));
                    Ok(())
                }
            },
            None => {
                let epoch = pool_data.take_epoch();
                info!(inner.log, "injected connection for new key {}", key);
                pool_data.entries.insert(
                    key,
                    Entry {
                        epoch,
                        state: ConnectionState::Established(conn),
                    },
                );
                Ok(())
            }
        }
    }

    /// Stop the pool and close every connection it holds.
    ///
    /// Every request blocked on a dial wakes up with `Error::Closed`, every
    /// entry is marked closed, and every later operation fails with
    /// `Error::Closed`. This function blocks the caller until every dial thread
    /// has finished, so no dial can hand the pool a connection after
    /// `shutdown` returns. Calling it again only repeats the wait.
    pub fn shutdown(&self) {
        let inner = &self.inner;

        let to_close = {
            let mut guard = inner.protected_data.pool_data_lock();
            let pool_data = &mut *guard;

            if pool_data.closed {
                trace!(inner.log, "shutdown called on stopped pool");
                Vec::new()
            } else {
                pool_data.closed = true;
                info!(
                    inner.log,
                    "shutting down pool with {} entries",
                    pool_data.entries.len()
                );

                let mut to_close = Vec::new();
                for (key, entry) in pool_data.entries.iter_mut() {
                    if let ConnectionState::Established(conn) = &entry.state {
                        to_close.push((key.clone(), Arc::clone(conn)));
                    }
                    entry.state.resolve(ConnectionState::Failed(Error::Closed));
                }
                to_close
            }
        };

        // Close outside the lock so that external code never runs while the
        // pool is locked.
        for (key, conn) in to_close {
            close_connection(&inner.log, &key, &*conn);
        }

        trace!(
            inner.log,
            "waiting for {} dial threads",
            inner.dial_tracker.in_flight()
        );
        inner.dial_tracker.wait_idle();
        info!(inner.log, "pool stopped");
    }

    /// Return the pool's entry and dial counts, or `None` once the pool has
    /// been shut down.
    pub fn get_stats(&self) -> Option<DialPoolStats> {
        let pool_data = self.inner.protected_data.pool_data_lock();
        if pool_data.closed {
            return None;
        }

        let mut stats = DialPoolStats::new();
        pool_data
            .entries
            .values()
            .for_each(|entry| match entry.state.status() {
                Status::Opening => stats.opening += ConnectionCount::from(1),
                Status::Established => {
                    stats.established += ConnectionCount::from(1)
                }
                Status::Failed => stats.failed += ConnectionCount::from(1),
            });
        stats.dials_in_flight = self.inner.dial_tracker.in_flight();
        Some(stats)
    }

    pub fn get_state(&self) -> PoolState {
        if self.inner.protected_data.pool_data_lock().closed {
            PoolState::Stopped
        } else {
            PoolState::Running
        }
    }
}

impl<K, C, D> Drop for Inner<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    fn drop(&mut self) {
        // Every handle and every dial thread is gone. If nobody shut the pool
        // down, release what it still holds.
        let pool_data = self.protected_data.pool_data_lock();
        if pool_data.closed {
            return;
        }
        for (key, entry) in pool_data.entries.iter() {
            if let ConnectionState::Established(conn) = &entry.state {
                close_connection(&self.log, key, &**conn);
            }
        }
    }
}

// Start a dial thread for a freshly inserted opening entry. Must be called
// with the pool lock held so that the entry cannot change before the dial is
// registered with the tracker.
fn spawn_dial<K, C, D>(
    inner: &Arc<Inner<K, C, D>>,
    pool_data: &mut PoolData<K, C, C::Error>,
    key: &K,
    epoch: u64,
) where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    inner.dial_tracker.add();

    let task = DialTask {
        inner: Arc::clone(inner),
        key: key.clone(),
        epoch,
        started: false,
        finished: false,
    };
    let spawned = thread::Builder::new()
        .name(inner.dial_thread_name.clone())
        .spawn(move || task.run());

    if let Err(err) = spawned {
        // The task was dropped unrun, which already released its tracker
        // registration. Its entry is resolved here because this thread holds
        // the lock.
        warn!(
            inner.log,
            "failed to spawn dial thread for key {}: {}", key, err
        );
        if let Some(entry) = pool_data.entries.get_mut(key) {
            if entry.epoch == epoch {
                entry
                    .state
                    .resolve(ConnectionState::Failed(Error::DialAborted));
            }
        }
    }
}

// One dial for one key. Dropping a task that started but never finished (the
// dialer panicked) resolves its entry as aborted.
struct DialTask<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    inner: Arc<Inner<K, C, D>>,
    key: K,
    epoch: u64,
    started: bool,
    finished: bool,
}

impl<K, C, D> DialTask<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    fn run(mut self) {
        self.started = true;
        debug!(
            self.inner.log,
            "dialing key {} (epoch {})", self.key, self.epoch
        );
        let result = self.inner.dialer.dial(&self.key);
        self.finish(result);
        self.finished = true;
    }

    fn finish(&self, result: Result<C, C::Error>) {
        let inner = &self.inner;

        let discarded = {
            let mut guard = inner.protected_data.pool_data_lock();
            match guard.entries.get_mut(&self.key) {
                Some(entry)
                    if entry.epoch == self.epoch
                        && entry.state.status() == Status::Opening =>
                {
                    let next = match result {
                        Ok(conn) => {
                            debug!(inner.log, "dialed key {}", self.key);
                            ConnectionState::Established(Arc::new(conn))
                        }
                        Err(err) => {
                            debug!(
                                inner.log,
                                "dial for key {} failed: {}", self.key, err
                            );
                            ConnectionState::Failed(Error::Dial(Arc::new(
                                err,
                            )))
                        }
                    };
                    entry.state.resolve(next);
                    None
                }
                _ => {
                    debug!(
                        inner.log,
                        "key {} resolved before its dial finished, \
                         discarding dial result",
                        self.key
                    );
                    result.ok()
                }
            }
        };

        if let Some(conn) = discarded {
            close_connection(&inner.log, &self.key, &conn);
        }
    }

    // Resolve the entry if this task never recorded a result for it.
    fn abort(&self) {
        let inner = &self.inner;
        warn!(inner.log, "dial for key {} ended without a result", self.key);

        let mut guard = inner.protected_data.pool_data_lock();
        if let Some(entry) = guard.entries.get_mut(&self.key) {
            if entry.epoch == self.epoch
                && entry.state.status() == Status::Opening
            {
                entry
                    .state
                    .resolve(ConnectionState::Failed(Error::DialAborted));
            }
        }
    }
}

impl<K, C, D> Drop for DialTask<K, C, D>
where
    K: DialKey,
    C: Connection,
    D: Dialer<K, C>,
{
    fn drop(&mut self) {
        if self.started && !self.finished {
            self.abort();
        }
        // Released last so that shutdown also waits for any race-loser close
        // above.
        self.inner.dial_tracker.done();
    }
}

fn close_connection<K, C>(log: &Logger, key: &K, conn: &C)
where
    K: DialKey,
    C: Connection,
{
    debug!(log, "closing connection for key {}", key);
    if let Err(err) = conn.close() {
        warn!(
            log,
            "Failed to properly close connection for key {}. Reason: {}",
            key,
            err
        );
    }
}
