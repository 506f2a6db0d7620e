//! iocring error types.
//!
//! Two layers:
//! - [`SocketError`] carries a raw OS status (errno). It is what an issued
//!   operation fails with, whether the OS rejected it up front or reported
//!   the failure on completion.
//! - [`Error`] is the crate-wide enum returned by the public API.

use nix::errno::Errno;
use std::fmt;
use std::io;
use thiserror::Error;

/// A socket-level failure carrying the OS status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketError {
    code: i32,
}

impl SocketError {
    /// Wrap a positive errno value.
    #[inline]
    pub const fn new(code: i32) -> Self {
        Self { code }
    }

    /// Build from a kernel-style result (`< 0` is `-errno`).
    ///
    /// Returns `None` for non-negative results.
    #[inline]
    pub fn from_result(result: i32) -> Option<Self> {
        (result < 0).then(|| Self::new(-result))
    }

    /// The errno of the last failed libc call on this thread.
    #[inline]
    pub fn last_os_error() -> Self {
        Self::new(Errno::last() as i32)
    }

    /// The raw OS status.
    #[inline]
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The operation was aborted by cancellation (port shutdown or stop).
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.code == libc::ECANCELED
    }

    /// The call would have blocked.
    #[inline]
    pub fn would_block(&self) -> bool {
        self.code == libc::EAGAIN || self.code == libc::EWOULDBLOCK
    }

    /// Errors that mean the socket itself is unusable for the request,
    /// as opposed to the connection failing mid-flight.
    pub fn is_bad_socket_state(&self) -> bool {
        matches!(
            self.code,
            libc::EBADF
                | libc::ENOTSOCK
                | libc::ENOTCONN
                | libc::EINVAL
                | libc::EFAULT
                | libc::EOPNOTSUPP
                | libc::EDESTADDRREQ
        )
    }
}

impl fmt::Debug for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketError")
            .field("code", &self.code)
            .field("desc", &Errno::from_raw(self.code).desc())
            .finish()
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (os error {})", Errno::from_raw(self.code).desc(), self.code)
    }
}

impl std::error::Error for SocketError {}

impl From<SocketError> for io::Error {
    fn from(e: SocketError) -> Self {
        io::Error::from_raw_os_error(e.code)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The OS rejected or failed a socket operation.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Wrong result object passed to an end call, end called twice,
    /// server started without an endpoint, and similar caller mistakes.
    #[error("protocol misuse: {0}")]
    Misuse(&'static str),

    /// Buffer region or parameter out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The completion port is shut down; nothing can be issued.
    #[error("completion port is shut down")]
    PortClosed,

    /// Cancellation was requested before the operation was issued.
    #[error("operation cancelled")]
    Cancelled,

    /// io_uring or eventfd setup failed.
    #[error("setup failed: errno {0}")]
    Setup(i32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The socket error behind this error, if any.
    pub fn socket_error(&self) -> Option<SocketError> {
        match self {
            Self::Socket(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Socket(s) => s.into(),
            Error::Io(io) => io,
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            Error::Misuse(_) | Error::InvalidArgument(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
            Error::PortClosed => io::Error::new(io::ErrorKind::NotConnected, e),
            Error::Setup(code) => io::Error::from_raw_os_error(code),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_splits_sign() {
        assert_eq!(SocketError::from_result(5), None);
        assert_eq!(SocketError::from_result(0), None);
        let e = SocketError::from_result(-libc::ECONNRESET).unwrap();
        assert_eq!(e.code(), libc::ECONNRESET);
    }

    #[test]
    fn cancelled_is_recognised() {
        assert!(SocketError::new(libc::ECANCELED).is_cancelled());
        assert!(!SocketError::new(libc::ECONNREFUSED).is_cancelled());
    }

    #[test]
    fn bad_state_classification() {
        assert!(SocketError::new(libc::EBADF).is_bad_socket_state());
        assert!(SocketError::new(libc::ENOTCONN).is_bad_socket_state());
        assert!(!SocketError::new(libc::ECONNRESET).is_bad_socket_state());
        assert!(!SocketError::new(libc::EPIPE).is_bad_socket_state());
    }

    #[test]
    fn io_error_keeps_raw_code() {
        let io: io::Error = Error::Socket(SocketError::new(libc::EPIPE)).into();
        assert_eq!(io.raw_os_error(), Some(libc::EPIPE));

        let io: io::Error = Error::Misuse("twice").into();
        assert_eq!(io.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn display_mentions_code() {
        let s = SocketError::new(libc::ECONNREFUSED).to_string();
        assert!(s.contains(&libc::ECONNREFUSED.to_string()));
    }
}
