//! Status codes surfaced by the session core.

use std::fmt;
use std::io;

/// Error kinds returned by session-core operations.
///
/// Errors from the command layer and from transports are propagated
/// unchanged; the session layer does not retry on behalf of the caller
/// (socket setup is the one exception, and it only retries `ECONNRESET`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Caller-supplied argument inconsistent (header mismatch, unusable fd).
    BadValue,
    /// A lease was requested on a session with no outgoing connections.
    WouldBlock,
    /// Transport construction failed, retries were exhausted, or no more
    /// specific kind fits.
    Unknown,
    /// No resolved address could be connected.
    NameNotFound,
    /// The peer closed the connection.
    DeadObject,
    /// The shutdown trigger could not be created.
    InvalidOperation,
    /// The shutdown trigger fired during a blocking operation.
    Shutdown,
    /// Underlying syscall failed; carries the positive `errno` value.
    Os(i32),
}

impl Error {
    /// Capture the calling thread's current `errno`.
    pub(crate) fn from_errno() -> Self {
        Self::from_io(&io::Error::last_os_error())
    }

    /// Map an [`io::Error`] onto a status, preserving the OS error code when
    /// one is present.
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) if errno != 0 => Error::Os(errno),
            _ => Error::Unknown,
        }
    }

    /// True if this error was caused by the shutdown trigger firing.
    pub fn is_shutdown(self) -> bool {
        self == Error::Shutdown
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadValue => write!(f, "bad value"),
            Error::WouldBlock => write!(f, "would block"),
            Error::Unknown => write!(f, "unknown error"),
            Error::NameNotFound => write!(f, "name not found"),
            Error::DeadObject => write!(f, "dead object"),
            Error::InvalidOperation => write!(f, "invalid operation"),
            Error::Shutdown => write!(f, "shutdown triggered"),
            Error::Os(errno) => {
                write!(f, "{} ({})", io::Error::from_raw_os_error(*errno), -errno)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Raw `errno` of the last failed syscall on this thread.
pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
