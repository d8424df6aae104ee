//! Error types for the connection engine.
//!
//! Startup failures (`BindError`, driver initialization) are fatal.
//! Everything that happens on an established connection is
//! connection-scoped and never leaves the engine.

use crate::runtime::op::Op;
use std::io;
use thiserror::Error;

/// Failure to bind or listen on the configured endpoint.
#[derive(Debug, Error)]
pub enum BindError {
    /// Another socket (or a non-socket file) already occupies the address.
    #[error("address {addr} already in use")]
    AddrInUse {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The process may not bind this address (e.g. a privileged port).
    #[error("permission denied binding {addr}")]
    PermissionDenied {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Any other socket setup failure.
    #[error("failed to bind {addr}: {source}")]
    Other {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn from_io(addr: impl Into<String>, source: io::Error) -> Self {
        let addr = addr.into();
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse { addr, source },
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied { addr, source },
            _ => BindError::Other { addr, source },
        }
    }
}

/// A submission the driver could not accept.
///
/// The descriptor is always handed back so the caller can retry or
/// reclaim its buffer.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The submission queue is saturated.
    #[error("submission queue full")]
    QueueFull(Op),
    /// An accept is already outstanding on this driver.
    #[error("accept already armed")]
    AcceptArmed(Op),
}

impl SubmitError {
    /// Recover the descriptor that failed to submit.
    pub fn into_op(self) -> Op {
        match self {
            SubmitError::QueueFull(op) => op,
            SubmitError::AcceptArmed(op) => op,
        }
    }

    /// Whether retrying after a flush may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::QueueFull(_))
    }
}

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Bind(#[from] BindError),
    /// The asynchronous I/O facility could not be initialized.
    #[error("driver initialization failed: {0}")]
    DriverInit(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The selected backend does not exist on this platform.
    #[error("{0} runtime is not supported on this platform")]
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_classification() {
        let err = BindError::from_io(
            "127.0.0.1:80",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, BindError::PermissionDenied { .. }));

        let err = BindError::from_io("127.0.0.1:80", io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(err, BindError::AddrInUse { .. }));
        assert_eq!(err.to_string(), "address 127.0.0.1:80 already in use");

        let err = BindError::from_io("x", io::Error::from(io::ErrorKind::InvalidInput));
        assert!(matches!(err, BindError::Other { .. }));
    }

    #[test]
    fn test_submit_error_returns_op() {
        let err = SubmitError::QueueFull(Op::accept(3));
        assert!(err.is_retryable());
        let op = err.into_op();
        assert_eq!(op.fd(), 3);

        let err = SubmitError::AcceptArmed(Op::accept(4));
        assert!(!err.is_retryable());
    }
}
