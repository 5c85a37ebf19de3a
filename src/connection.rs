// Copyright 2020 Joyent, Inc.

use std::error;

/// dialpool connection
///
/// The `Connection` trait defines the interface that must be implemented by a
/// connection in order to be managed by a [`DialPool`]. A connection need not
/// be limited to a TCP socket, but could be any logical notion of a
/// connection that can be released.
///
/// The pool hands out connections as `Arc<C>`, so every caller that waited on
/// the same dial shares a single instance. For that reason `close` takes a
/// shared reference.
///
/// [`DialPool`]: ../dial_pool/struct.DialPool.html
pub trait Connection: Send + Sync + 'static {
    /// The error type returned by the `close` function and by the
    /// [`Dialer`](../dialer/trait.Dialer.html) that establishes the
    /// connection. Each implementation of the `Connection` trait may choose
    /// the appropriate concrete error type, constrained only to implement the
    /// standard library
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait.
    type Error: error::Error + Send + Sync + 'static;
    /// Release the connection. The pool invokes this at most once per
    /// connection: when the pool shuts down while holding it, or when a dial
    /// completes after the key was already resolved some other way. Errors
    /// are logged and otherwise ignored.
    fn close(&self) -> Result<(), Self::Error>;
}
