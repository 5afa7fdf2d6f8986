//! Unified error type.

use std::fmt;
use std::net::AddrParseError;

/// Shorthand for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by mixer's fallible operations.
///
/// Hooks and handlers do not return errors: what they want the client to see
/// they write to the response. This type surfaces the few places where the
/// pipeline itself can fail: an optional sink capability that is missing,
/// a write the transport rejected, or a server that could not start.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wrapped sink does not provide the requested capability.
    #[error("the response sink does not support {0}")]
    Unsupported(Capability),

    /// The connection was already taken over earlier in this exchange.
    #[error("connection already taken over")]
    AlreadyTakenOver,

    /// The transport failed a write, or the server could not bind/accept.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// [`Server::bind`](crate::Server::bind) was given an unparsable address.
    #[error("invalid socket address: {0}")]
    InvalidAddr(#[from] AddrParseError),
}

/// Optional response-sink capabilities whose absence is reported as an error.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Capability {
    Flush,
    Takeover,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flush    => "flushing",
            Self::Takeover => "connection takeover",
        })
    }
}
