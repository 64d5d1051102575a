//! Crate-level error type.
//!
//! I/O-path failures inside an exchange are recovered locally and never
//! surface here. What does surface is what a caller has to decide about:
//! listener bind/open failures, outbound address exhaustion, and misuse of
//! an exchange that is not active.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors returned by the listener, the transport and the response API.
#[derive(Debug)]
pub enum Error {
    /// Underlying socket operation failed.
    Io(io::Error),
    /// Every candidate remote address was tried and none accepted a connection.
    Unreachable(Vec<SocketAddr>),
    /// A response finish was attempted before `init` or after `recycle`.
    InactiveExchange,
    /// An operation was issued in a state that does not allow it.
    InvalidState(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Unreachable(addrs) => {
                write!(f, "no remote address reachable (tried ")?;
                for (i, addr) in addrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{addr}")?;
                }
                write!(f, ")")
            }
            Error::InactiveExchange => write!(f, "exchange is not active"),
            Error::InvalidState(what) => write!(f, "invalid state: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
