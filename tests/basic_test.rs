// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use quickcheck::quickcheck;
use slog::{o, Drain, Logger};

use dialpool::connection::Connection;
use dialpool::dial_pool::types::{DialPoolOptions, PoolState};
use dialpool::dial_pool::DialPool;
use dialpool::error::Error;

#[derive(Clone, Debug, PartialEq)]
pub struct DummyError(String);

impl fmt::Display for DummyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DummyError {}

#[derive(Debug)]
pub struct DummyConnection {
    key: u32,
    closed: Arc<AtomicBool>,
}

impl DummyConnection {
    fn new(key: u32) -> Self {
        DummyConnection {
            key,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for DummyConnection {
    type Error = DummyError;

    fn close(&self) -> Result<(), DummyError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// A connection whose close always fails. The pool must swallow the error.
#[derive(Debug)]
pub struct StubbornConnection;

impl Connection for StubbornConnection {
    type Error = DummyError;

    fn close(&self) -> Result<(), DummyError> {
        Err(DummyError(String::from("close refused")))
    }
}

// Holds dialers until the test opens it.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cvar: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cvar.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cvar.wait(open).unwrap();
        }
    }
}

// A dialer that reports every dial on a channel, then blocks on the gate for
// the keys it was told to hold. Every connection it creates is recorded so
// tests can check whether the pool closed it.
struct GatedDialer {
    gate: Arc<Gate>,
    held_keys: Vec<u32>,
    dials: Arc<AtomicUsize>,
    ready_tx: Mutex<Sender<u32>>,
    created: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

struct GatedDialerHandle {
    gate: Arc<Gate>,
    dials: Arc<AtomicUsize>,
    ready_rx: Receiver<u32>,
    created: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

fn gated_dialer(held_keys: Vec<u32>) -> (GatedDialer, GatedDialerHandle) {
    let gate = Arc::new(Gate::default());
    let dials = Arc::new(AtomicUsize::new(0));
    let created = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = channel();

    let dialer = GatedDialer {
        gate: gate.clone(),
        held_keys,
        dials: dials.clone(),
        ready_tx: Mutex::new(ready_tx),
        created: created.clone(),
    };
    let handle = GatedDialerHandle {
        gate,
        dials,
        ready_rx,
        created,
    };
    (dialer, handle)
}

impl dialpool::dialer::Dialer<u32, DummyConnection> for GatedDialer {
    fn dial(&self, key: &u32) -> Result<DummyConnection, DummyError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let _ = self.ready_tx.lock().unwrap().send(*key);
        if self.held_keys.contains(key) {
            self.gate.wait();
        }
        let conn = DummyConnection::new(*key);
        self.created.lock().unwrap().push(conn.closed.clone());
        Ok(conn)
    }
}

fn counting_dialer(
    dials: Arc<AtomicUsize>,
) -> impl Fn(&u32) -> Result<DummyConnection, DummyError> + Send + Sync + 'static
{
    move |key: &u32| -> Result<DummyConnection, DummyError> {
        dials.fetch_add(1, Ordering::SeqCst);
        Ok(DummyConnection::new(*key))
    }
}

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[test]
fn dial_pool_request() {
    let (dialer, handle) = gated_dialer(vec![1]);
    let pool_opts = DialPoolOptions {
        log: Some(test_logger()),
        dial_thread_name: Some(String::from("dial-pool-request")),
        initial_capacity: Some(4),
    };
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(pool_opts, dialer);

    let pool_clone = pool.clone();
    let requester = thread::spawn(move || pool_clone.request(&1));

    assert_eq!(handle.ready_rx.recv().unwrap(), 1);
    handle.gate.open();

    let conn = requester.join().unwrap().expect("request failed");
    assert_eq!(conn.key, 1);
    assert_eq!(handle.dials.load(Ordering::SeqCst), 1);
}

#[test]
fn dial_pool_single_flight() {
    let (dialer, handle) = gated_dialer(vec![1]);
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(DialPoolOptions::default(), dialer);

    let n = 10;
    let barrier = Arc::new(Barrier::new(n + 1));
    let requesters: Vec<_> = (0..n)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.request(&1)
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(handle.ready_rx.recv().unwrap(), 1);
    // Give the remaining requesters time to pile up behind the dial.
    thread::sleep(Duration::from_millis(50));
    handle.gate.open();

    let conns: Vec<_> = requesters
        .into_iter()
        .map(|r| r.join().unwrap().expect("request failed"))
        .collect();

    assert_eq!(handle.dials.load(Ordering::SeqCst), 1);
    for conn in conns.iter() {
        assert_eq!(conn.key, 1);
        assert!(Arc::ptr_eq(conn, &conns[0]));
    }
}

#[test]
fn dial_pool_concurrent_dial() {
    let dials = Arc::new(AtomicUsize::new(0));
    let pool = DialPool::new(
        DialPoolOptions::default(),
        counting_dialer(dials.clone()),
    );

    let requesters: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || pool.request(&1))
        })
        .collect();

    for requester in requesters {
        let conn = requester.join().unwrap().expect("request failed");
        assert_eq!(conn.key, 1);
    }
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    // Established keys are served without dialing again.
    let conn = pool.request(&1).expect("request failed");
    assert_eq!(conn.key, 1);
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[test]
fn dial_pool_different_keys_not_blocked() {
    let (dialer, handle) = gated_dialer(vec![10]);
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(DialPoolOptions::default(), dialer);

    let pool_clone = pool.clone();
    let blocked = thread::spawn(move || pool_clone.request(&10));
    assert_eq!(handle.ready_rx.recv().unwrap(), 10);

    // Key 10 is still mid-dial; key 1 must not wait for it.
    let conn = pool.request(&1).expect("request failed");
    assert_eq!(conn.key, 1);

    handle.gate.open();
    let conn = blocked.join().unwrap().expect("request failed");
    assert_eq!(conn.key, 10);
}

#[test]
fn dial_pool_connect_after_error() {
    let fail = Arc::new(AtomicBool::new(true));
    let dials = Arc::new(AtomicUsize::new(0));

    let fail_clone = fail.clone();
    let dials_clone = dials.clone();
    let pool = DialPool::new(
        DialPoolOptions::default(),
        move |key: &u32| -> Result<DummyConnection, DummyError> {
            dials_clone.fetch_add(1, Ordering::SeqCst);
            if fail_clone.load(Ordering::SeqCst) {
                Err(DummyError(String::from("test")))
            } else {
                Ok(DummyConnection::new(*key))
            }
        },
    );

    match pool.request(&1) {
        Err(Error::Dial(err)) => {
            assert_eq!(*err, DummyError(String::from("test")))
        }
        other => panic!("expected dial error, got {:?}", other),
    }

    // The failure was pruned, so the key can be dialed again.
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.failed, 0.into());
    assert_eq!(stats.opening, 0.into());

    fail.store(false, Ordering::SeqCst);
    let conn = pool.request(&1).expect("request failed");
    assert_eq!(conn.key, 1);
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[test]
fn dial_pool_shares_dial_error() {
    let gate = Arc::new(Gate::default());
    let dials = Arc::new(AtomicUsize::new(0));

    let gate_clone = gate.clone();
    let dials_clone = dials.clone();
    let pool = DialPool::new(
        DialPoolOptions::default(),
        move |_key: &u32| -> Result<DummyConnection, DummyError> {
            dials_clone.fetch_add(1, Ordering::SeqCst);
            gate_clone.wait();
            Err(DummyError(String::from("unreachable")))
        },
    );

    let barrier = Arc::new(Barrier::new(6));
    let requesters: Vec<_> = (0..5)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.request(&7)
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(100));
    gate.open();

    let errors: Vec<_> = requesters
        .into_iter()
        .map(|r| match r.join().unwrap() {
            Err(Error::Dial(err)) => err,
            other => panic!("expected dial error, got {:?}", other),
        })
        .collect();

    assert_eq!(dials.load(Ordering::SeqCst), 1);
    for err in errors.iter() {
        assert!(Arc::ptr_eq(err, &errors[0]));
    }
}

#[test]
fn dial_pool_inject_unseen_key() {
    let dials = Arc::new(AtomicUsize::new(0));
    let pool = DialPool::new(
        DialPoolOptions::default(),
        counting_dialer(dials.clone()),
    );

    let injected = Arc::new(DummyConnection::new(42));
    assert!(pool.inject(5, injected.clone()).is_ok());

    let conn = pool.request(&5).expect("request failed");
    assert!(Arc::ptr_eq(&conn, &injected));
    assert_eq!(dials.load(Ordering::SeqCst), 0);
}

#[test]
fn dial_pool_inject_established_refused() {
    let dials = Arc::new(AtomicUsize::new(0));
    let pool = DialPool::new(
        DialPoolOptions::default(),
        counting_dialer(dials.clone()),
    );

    let original = pool.request(&3).expect("request failed");
    let replacement = Arc::new(DummyConnection::new(99));

    let err = pool.inject(3, replacement.clone()).unwrap_err();
    assert!(err.is_established());
    assert_eq!(err.to_string(), "key 3: connection already established");

    let conn = pool.request(&3).expect("request failed");
    assert!(Arc::ptr_eq(&conn, &original));
    assert!(!replacement.is_closed());
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[test]
fn dial_pool_inject_resolves_pending_dial() {
    let (dialer, handle) = gated_dialer(vec![8]);
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(DialPoolOptions::default(), dialer);

    let requesters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || pool.request(&8))
        })
        .collect();
    assert_eq!(handle.ready_rx.recv().unwrap(), 8);

    let injected = Arc::new(DummyConnection::new(800));
    assert!(pool.inject(8, injected.clone()).is_ok());

    // Waiters are released by the injection while the dial is still held.
    for requester in requesters {
        let conn = requester.join().unwrap().expect("request failed");
        assert!(Arc::ptr_eq(&conn, &injected));
    }

    // Let the losing dial finish; the pool must close what it produced and
    // keep the injected connection.
    handle.gate.open();
    while pool.get_stats().unwrap().dials_in_flight > 0.into() {
        thread::sleep(Duration::from_millis(5));
    }
    let created = handle.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert!(created[0].load(Ordering::SeqCst));
    assert!(!injected.is_closed());

    let conn = pool.request(&8).expect("request failed");
    assert!(Arc::ptr_eq(&conn, &injected));
}

#[test]
fn dial_pool_shutdown_while_dialing() {
    let (dialer, handle) = gated_dialer(vec![1]);
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(DialPoolOptions::default(), dialer);

    let pool_clone = pool.clone();
    let requester = thread::spawn(move || pool_clone.request(&1));
    assert_eq!(handle.ready_rx.recv().unwrap(), 1);

    let gate = handle.gate.clone();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        gate.open();
    });

    pool.shutdown();

    // shutdown only returns once the dial has finished, and the connection
    // it produced was closed rather than handed out.
    {
        let created = handle.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].load(Ordering::SeqCst));
    }

    let err = requester.join().unwrap().unwrap_err();
    assert!(err.is_closed());
    assert_eq!(err.to_string(), "connection pool is closed");
    opener.join().unwrap();
}

#[test]
fn dial_pool_shutdown_closes_connections() {
    let dials = Arc::new(AtomicUsize::new(0));
    let pool = DialPool::new(
        DialPoolOptions::default(),
        counting_dialer(dials.clone()),
    );

    let dialed = pool.request(&1).expect("request failed");
    let injected = Arc::new(DummyConnection::new(2));
    pool.inject(2, injected.clone()).unwrap();
    assert_eq!(pool.get_stats().unwrap().established, 2.into());

    pool.shutdown();
    assert!(dialed.is_closed());
    assert!(injected.is_closed());
    assert_eq!(pool.get_state(), PoolState::Stopped);
    assert!(pool.get_stats().is_none());

    // Pre-existing and new keys alike are refused.
    assert!(pool.request(&1).unwrap_err().is_closed());
    assert!(pool.request(&3).unwrap_err().is_closed());
    let late = Arc::new(DummyConnection::new(4));
    assert!(pool.inject(4, late).unwrap_err().is_closed());
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    // A second shutdown neither blocks nor fails.
    pool.shutdown();
    assert_eq!(pool.get_state().to_string(), "stopped");
}

#[test]
fn dial_pool_close_errors_ignored() {
    let pool = DialPool::new(
        DialPoolOptions::default(),
        |_key: &String| -> Result<StubbornConnection, DummyError> {
            Ok(StubbornConnection)
        },
    );

    pool.request(&String::from("a")).expect("request failed");
    pool.inject(String::from("b"), Arc::new(StubbornConnection))
        .unwrap();
    pool.shutdown();
    assert_eq!(pool.get_state(), PoolState::Stopped);
}

#[test]
fn dial_pool_dialer_panic() {
    let panic_next = Arc::new(AtomicBool::new(true));

    let panic_clone = panic_next.clone();
    let pool = DialPool::new(
        DialPoolOptions::default(),
        move |key: &u32| -> Result<DummyConnection, DummyError> {
            if panic_clone.swap(false, Ordering::SeqCst) {
                panic!("dialer exploded");
            }
            Ok(DummyConnection::new(*key))
        },
    );

    match pool.request(&6) {
        Err(Error::DialAborted) => (),
        other => panic!("expected aborted dial, got {:?}", other),
    }

    let conn = pool.request(&6).expect("request failed");
    assert_eq!(conn.key, 6);
    pool.shutdown();
}

#[test]
fn dial_pool_stats() {
    let (dialer, handle) = gated_dialer(vec![2]);
    let pool: DialPool<u32, DummyConnection, _> =
        DialPool::new(DialPoolOptions::default(), dialer);
    assert_eq!(pool.get_state(), PoolState::Running);

    pool.request(&1).expect("request failed");

    let pool_clone = pool.clone();
    let requester = thread::spawn(move || pool_clone.request(&2));
    assert_eq!(handle.ready_rx.recv().unwrap(), 1);
    assert_eq!(handle.ready_rx.recv().unwrap(), 2);

    // The thread that dialed key 1 may still be winding down.
    while pool.get_stats().unwrap().dials_in_flight > 1.into() {
        thread::sleep(Duration::from_millis(5));
    }
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.established, 1.into());
    assert_eq!(stats.opening, 1.into());
    assert_eq!(stats.failed, 0.into());
    assert_eq!(stats.dials_in_flight, 1.into());

    handle.gate.open();
    requester.join().unwrap().expect("request failed");

    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.established, 2.into());
    assert_eq!(stats.opening, 0.into());
}

quickcheck! {
    fn prop_injected_keys_never_dialed(keys: Vec<u16>) -> bool {
        let dials = Arc::new(AtomicUsize::new(0));
        let dials_clone = dials.clone();
        let pool = DialPool::new(
            DialPoolOptions::default(),
            move |key: &u16| -> Result<DummyConnection, DummyError> {
                dials_clone.fetch_add(1, Ordering::SeqCst);
                Ok(DummyConnection::new(u32::from(*key)))
            },
        );

        let unique: HashSet<u16> = keys.into_iter().collect();
        let injected: Vec<(u16, Arc<DummyConnection>)> = unique
            .iter()
            .map(|key| (*key, Arc::new(DummyConnection::new(u32::from(*key)))))
            .collect();

        let all_injected = injected
            .iter()
            .all(|(key, conn)| pool.inject(*key, conn.clone()).is_ok());
        let all_served = injected.iter().all(|(key, conn)| {
            pool.request(key)
                .map(|served| Arc::ptr_eq(&served, conn))
                .unwrap_or(false)
        });

        pool.shutdown();
        all_injected
            && all_served
            && dials.load(Ordering::SeqCst) == 0
            && injected.iter().all(|(_, conn)| conn.is_closed())
    }
}
