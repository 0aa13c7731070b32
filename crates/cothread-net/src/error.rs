//! Error types for connections and transactions

use nix::errno::Errno;
use thiserror::Error;

/// Result type for connection and transaction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by streams, connections and the transaction layer
///
/// `WouldBlock` and `Interrupted` are transient: callers retry them in
/// their own loop and never report them as failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation cannot complete without waiting
    #[error("operation would block")]
    WouldBlock,

    /// Interrupted before anything was transferred
    #[error("operation interrupted")]
    Interrupted,

    /// The peer closed the connection between messages
    #[error("connection closed by peer")]
    Eof,

    /// Malformed frame, failed negotiation or attribute-policy violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer sent an explicit error frame
    #[error("peer error (type {kind:#06x}, code {code:#06x}): {text}")]
    PeerError { kind: u16, code: u16, text: String },

    /// Transport failure
    #[error("os error: {0}")]
    Os(Errno),
}

impl Error {
    /// True for errors a caller should simply retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Interrupted)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        match e {
            Errno::EAGAIN => Error::WouldBlock,
            Errno::EINTR => Error::Interrupted,
            e => Error::Os(e),
        }
    }
}

impl From<cothread_core::SchedError> for Error {
    fn from(e: cothread_core::SchedError) -> Self {
        match e {
            cothread_core::SchedError::Os(e) => Error::from(e),
            e => Error::Protocol(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::from(Errno::EAGAIN), Error::WouldBlock);
        assert_eq!(Error::from(Errno::EINTR), Error::Interrupted);
        assert_eq!(Error::from(Errno::ECONNRESET), Error::Os(Errno::ECONNRESET));
        assert!(Error::WouldBlock.is_transient());
        assert!(!Error::Eof.is_transient());
    }

    #[test]
    fn test_display() {
        let e = Error::PeerError { kind: 0, code: 0, text: "bad version".into() };
        assert_eq!(e.to_string(), "peer error (type 0x0000, code 0x0000): bad version");
        assert_eq!(Error::protocol("short frame").to_string(), "protocol error: short frame");
    }
}
