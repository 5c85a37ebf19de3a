// Copyright 2020 Joyent, Inc.

//! A keyed, single-flight connection pool
//!
//! dialpool keeps at most one connection per *key*, where a key is whatever
//! identifies a destination for the caller: an address, a shard number, a
//! peer name. Use of dialpool requires an implementation of the
//! [`Connection`](connection/trait.Connection.html) trait and a
//! [`Dialer`](dialer/trait.Dialer.html) that establishes a connection for a
//! key. Any thread-safe closure `Fn(&K) -> Result<C, C::Error>` is a `Dialer`.
//!
//! ## Single-flight dialing
//!
//! The first [`request`](dial_pool/struct.DialPool.html#method.request) for a
//! key starts a dial on a dedicated thread. Every request for the same key that
//! arrives while that dial is outstanding waits for it instead of dialing
//! again, and every one of them receives the same `Arc` of the connection, or
//! the same error. Requests for other keys never wait on it: the pool lock is
//! only held for bookkeeping and never while a dial is running.
//!
//! A failed dial is not remembered. The request that started the dial removes
//! the failed entry after it has observed the failure, so the next request for
//! the key dials again.
//!
//! ## Injection
//!
//! A connection obtained outside the pool, for example one accepted from a
//! listening socket, can be handed to the pool with
//! [`inject`](dial_pool/struct.DialPool.html#method.inject). If a dial for the
//! key is outstanding, its waiters are resolved with the injected connection
//! and the dial's result is closed when it arrives. Injecting over a live
//! connection is refused with
//! [`Error::Established`](error/enum.Error.html).
//!
//! ## Shutdown
//!
//! [`shutdown`](dial_pool/struct.DialPool.html#method.shutdown) closes every
//! connection the pool holds, wakes every waiting request with
//! [`Error::Closed`](error/enum.Error.html), and blocks until all dial threads
//! have finished. Every later operation fails with `Error::Closed`.
//!
//! ## Example
//!
//! ```rust
//! use std::fmt;
//! use std::sync::Arc;
//!
//! use dialpool::connection::Connection;
//! use dialpool::dial_pool::types::DialPoolOptions;
//! use dialpool::dial_pool::DialPool;
//!
//! #[derive(Debug)]
//! struct ShardError;
//!
//! impl fmt::Display for ShardError {
//!     fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
//!         f.write_str("shard unavailable")
//!     }
//! }
//!
//! impl std::error::Error for ShardError {}
//!
//! #[derive(Debug)]
//! struct ShardConnection {
//!     shard: u32,
//! }
//!
//! impl Connection for ShardConnection {
//!     type Error = ShardError;
//!
//!     fn close(&self) -> Result<(), ShardError> {
//!         Ok(())
//!     }
//! }
//!
//! let pool = DialPool::new(
//!     DialPoolOptions::default(),
//!     |shard: &u32| -> Result<ShardConnection, ShardError> {
//!         Ok(ShardConnection { shard: *shard })
//!     },
//! );
//!
//! let first = pool.request(&3).unwrap();
//! let second = pool.request(&3).unwrap();
//! assert_eq!(first.shard, 3);
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! pool.shutdown();
//! assert!(pool.request(&3).unwrap_err().is_closed());
//! ```
//!
//! An implementation of the [`Connection`](connection/trait.Connection.html)
//! and [`Dialer`](dialer/trait.Dialer.html) traits for TCP is provided by the
//! `dialpool-tcp-stream-connection` crate in this workspace.

#![allow(missing_docs)]

pub mod connection;
pub mod dial_pool;
pub mod dialer;
pub mod error;
