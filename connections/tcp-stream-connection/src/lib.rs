// Copyright 2020 Joyent, Inc.

//! TCP support for dialpool
//!
//! [`TcpStreamConnection`] wraps a connected `TcpStream` so it can be held by
//! a `DialPool`, and [`TcpDialer`] dials any key that resolves to socket
//! addresses, such as a `SocketAddr` or a `"host:port"` string.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::Deref;
use std::time::Duration;

use slog::{debug, o, Drain, Logger};

use dialpool::connection::Connection;
use dialpool::dialer::{DialKey, Dialer};

/// A connected TCP stream owned by a dial pool.
///
/// Derefs to the underlying `TcpStream`. `Read` and `Write` are implemented
/// for `&TcpStream`, so the shared `Arc<TcpStreamConnection>` handed out by
/// the pool can be used for I/O directly.
#[derive(Debug)]
pub struct TcpStreamConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpStreamConnection {
    /// Wrap an already connected stream, for example one returned by
    /// `TcpListener::accept` that is about to be injected into a pool.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(TcpStreamConnection { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Connection for TcpStreamConnection {
    type Error = io::Error;

    fn close(&self) -> Result<(), Self::Error> {
        match self.stream.shutdown(Shutdown::Both) {
            // The peer got there first.
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                Ok(())
            }
            result => result,
        }
    }
}

impl Deref for TcpStreamConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream
    }
}

/// Dials TCP connections for keys that resolve to socket addresses.
///
/// Each address the key resolves to is tried in order and the first
/// successful connection wins. If all of them fail the error from the last
/// attempt is returned.
#[derive(Clone)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
    nodelay: bool,
    log: Logger,
}

impl TcpDialer {
    pub fn new() -> Self {
        TcpDialer {
            connect_timeout: None,
            nodelay: false,
            log: Logger::root(slog_stdlog::StdLog.fuse(), o!()),
        }
    }

    /// Bound each connection attempt by `timeout` instead of waiting for the
    /// operating system to give up.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set `TCP_NODELAY` on every dialed stream.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn logger(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }

    fn connect(&self, addr: &SocketAddr) -> io::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpDialer")
            .field("connect_timeout", &self.connect_timeout)
            .field("nodelay", &self.nodelay)
            .finish()
    }
}

impl<K> Dialer<K, TcpStreamConnection> for TcpDialer
where
    K: DialKey + ToSocketAddrs,
{
    fn dial(&self, key: &K) -> io::Result<TcpStreamConnection> {
        let mut last_err = None;

        for addr in key.to_socket_addrs()? {
            match self.connect(&addr) {
                Ok(stream) => {
                    debug!(self.log, "connected to {} for key {}", addr, key);
                    return TcpStreamConnection::new(stream);
                }
                Err(err) => {
                    debug!(
                        self.log,
                        "connect to {} for key {} failed: {}", addr, key, err
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("key {} resolved to no addresses", key),
            )
        }))
    }
}
