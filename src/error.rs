// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// The errors returned by a [`DialPool`](../dial_pool/struct.DialPool.html).
///
/// `E` is the error type of the pooled connection. A dial failure is shared
/// by every caller that waited on that dial, so the dialer's error is held
/// behind an `Arc` and handed out unmodified.
#[derive(Debug)]
pub enum Error<E> {
    /// The pool has been shut down. Every operation returns this once
    /// `shutdown` has begun, and it is forced onto every entry that was still
    /// pending at that time.
    Closed,
    /// An injection was refused because the key, rendered here as a string,
    /// already holds an established connection.
    Established(String),
    /// The dialer failed for the key.
    Dial(Arc<E>),
    /// The dial thread panicked or could not be started.
    DialAborted,
}

impl<E> Error<E> {
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    pub fn is_established(&self) -> bool {
        matches!(self, Error::Established(_))
    }

    /// The dialer's own error, if this is a dial failure.
    pub fn dial_error(&self) -> Option<&Arc<E>> {
        match self {
            Error::Dial(err) => Some(err),
            _ => None,
        }
    }
}

// Derived Clone would require `E: Clone`, which dial errors rarely are.
impl<E> Clone for Error<E> {
    fn clone(&self) -> Self {
        match self {
            Error::Closed => Error::Closed,
            Error::Established(key) => Error::Established(key.clone()),
            Error::Dial(err) => Error::Dial(Arc::clone(err)),
            Error::DialAborted => Error::DialAborted,
        }
    }
}

impl<E> fmt::Display for Error<E>
where
    E: fmt::Display,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Closed => fmt.write_str("connection pool is closed"),
            Error::Established(key) => write!(
                fmt,
                "key {}: connection already established",
                key
            ),
            Error::Dial(err) => fmt::Display::fmt(err, fmt),
            Error::DialAborted => {
                fmt.write_str("dial aborted before completing")
            }
        }
    }
}

impl<E> StdError for Error<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Dial(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
