//! Error types for the cothread scheduler

use nix::errno::Errno;
use thiserror::Error;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
///
/// Usage errors (suspending inside a critical section, killing a running
/// FSM, re-locking an owned mutex) are assertion failures, not variants here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// Operation was cancelled via CancellationToken
    #[error("operation cancelled")]
    Cancelled,

    /// The caller is not a task of any runtime
    #[error("not running inside a task")]
    NotInTask,

    /// The operation needs a thread group but the caller runs natively
    #[error("not running inside a thread group")]
    NotInGroup,

    /// The target thread group was released
    #[error("thread group released")]
    GroupReleased,

    /// The runtime is shutting down
    #[error("runtime shut down")]
    ShutDown,

    /// Configuration rejected by `validate()`
    #[error("invalid config: {0}")]
    Config(String),

    /// The backing OS thread could not be started
    #[error("failed to spawn task: {0}")]
    Spawn(String),

    /// Operating system error
    #[error("os error: {0}")]
    Os(#[from] Errno),
}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => SchedError::Os(Errno::from_raw(code)),
            None => SchedError::Spawn(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::Cancelled;
        assert_eq!(format!("{}", e), "operation cancelled");

        let e = SchedError::Os(Errno::EBADF);
        assert!(format!("{}", e).starts_with("os error: EBADF"));
    }

    #[test]
    fn test_error_conversion() {
        let io = std::io::Error::from_raw_os_error(Errno::EMFILE as i32);
        let sched: SchedError = io.into();
        assert_eq!(sched, SchedError::Os(Errno::EMFILE));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(SchedError::from(io), SchedError::Spawn(_)));
    }
}
