//! Error type for the resolver engine.

use std::error;
use std::fmt::{Display, Formatter};

//------------ Error ---------------------------------------------------------

/// The terminal status of a query or an engine operation.
///
/// Per-attempt problems such as a refused server or a timed-out datagram
/// are not surfaced directly. They are recorded on the query and only
/// reported once every permitted attempt has been used up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A configuration value is outside its permitted range.
    BadConfig(&'static str),

    /// The server address family is not supported by the socket provider.
    BadFamily,

    /// The submitted query bytes cannot be sent as a DNS message.
    BadQuery,

    /// The query was cancelled before it completed.
    Cancelled,

    /// The connection to the server was refused.
    ConnRefused,

    /// The server did not implement the requested operation.
    NotImp,

    /// The server refused to answer.
    Refused,

    /// The server reported an internal failure.
    ServFail,

    /// The channel was torn down while the query was pending.
    Shutdown,

    /// Every attempt ran into its deadline.
    Timeout,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::BadConfig(what) => {
                write!(f, "bad configuration value: {}", what)
            }
            Error::BadFamily => write!(f, "unsupported address family"),
            Error::BadQuery => write!(f, "malformed query"),
            Error::Cancelled => write!(f, "query cancelled"),
            Error::ConnRefused => write!(f, "connection refused"),
            Error::NotImp => write!(f, "server returned NOTIMP"),
            Error::Refused => write!(f, "server returned REFUSED"),
            Error::ServFail => write!(f, "server returned SERVFAIL"),
            Error::Shutdown => write!(f, "channel is shutting down"),
            Error::Timeout => write!(f, "timeout waiting for response"),
        }
    }
}

impl error::Error for Error {}
