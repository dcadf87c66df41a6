// ============================================
// File: crates/meshrelay-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! Errors raised by the collaborators the relay core talks to: peer
//! links, outbound dialing and datagram sockets.
//!
//! ## Error Categories
//! 1. **Link Errors**: peer link closed, send/receive failures
//! 2. **Dial Errors**: refused, unreachable, timeout, name resolution
//! 3. **Socket Errors**: bind failures, address in use
//! 4. **Injected Errors**: raised by the fault-injection decorators
//!
//! ## ⚠️ Important Note for Next Developer
//! - Dial errors are mapped to wire error codes by `error_code()`; keep
//!   the mapping in sync when adding variants
//! - The relay never retries a dial; classification is for the caller
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use meshrelay_common::error::CommonError;
use meshrelay_core::error::CoreError;
use meshrelay_core::protocol::ErrorCode;

// ============================================
// Result Type Alias
// ============================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// TransportError
// ============================================

/// Transport layer error types.
#[derive(Error, Debug)]
pub enum TransportError {
    // ========================================
    // Link Errors
    // ========================================

    /// The peer link has been closed by either side.
    #[error("Peer link closed")]
    LinkClosed,

    /// Send operation failed.
    #[error("Failed to send on {link}: {reason}")]
    SendFailed {
        /// Link description
        link: String,
        /// Why send failed
        reason: String,
    },

    /// Receive operation failed.
    #[error("Failed to receive on {link}: {reason}")]
    ReceiveFailed {
        /// Link description
        link: String,
        /// Why receive failed
        reason: String,
    },

    /// Bytes on the link did not form a valid frame.
    #[error("Framing error: {0}")]
    Framing(#[from] CoreError),

    // ========================================
    // Dial Errors
    // ========================================

    /// Target actively refused the connection.
    #[error("Connection to {target} refused")]
    ConnectionRefused {
        /// Dial target
        target: String,
    },

    /// Target host or network is unreachable.
    #[error("Target {target} unreachable: {reason}")]
    Unreachable {
        /// Dial target
        target: String,
        /// OS reason
        reason: String,
    },

    /// Domain name could not be resolved.
    #[error("Failed to resolve {host}: {reason}")]
    ResolveFailed {
        /// Host name
        host: String,
        /// Why resolution failed
        reason: String,
    },

    /// Operation timed out.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// What operation timed out
        operation: String,
    },

    // ========================================
    // Socket Errors
    // ========================================

    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Address we tried to bind to
        addr: SocketAddr,
        /// Why binding failed
        reason: String,
    },

    /// Address already in use.
    #[error("Address {addr} already in use")]
    AddressInUse {
        /// The address that's in use
        addr: SocketAddr,
    },

    /// Socket has been shut down.
    #[error("Transport is shutting down")]
    ShuttingDown,

    // ========================================
    // Fault Injection
    // ========================================

    /// Failure raised on purpose by a fault-injection decorator.
    #[error("Injected fault: {operation}")]
    Injected {
        /// Operation that was failed
        operation: String,
    },

    // ========================================
    // Wrapped Errors
    // ========================================

    /// I/O error from the system.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl TransportError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a `BindFailed` error.
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates an `Injected` error.
    pub fn injected(operation: impl Into<String>) -> Self {
        Self::Injected {
            operation: operation.into(),
        }
    }

    /// Classifies a failed connect by its OS error kind.
    pub fn from_connect(target: impl Into<String>, err: io::Error) -> Self {
        let target = target.into();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { target },
            io::ErrorKind::TimedOut => Self::Timeout {
                operation: format!("connect to {target}"),
            },
            io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::Unreachable {
                target,
                reason: err.to_string(),
            },
            _ => match err.raw_os_error() {
                // ENETUNREACH / EHOSTUNREACH
                Some(101 | 113) => Self::Unreachable {
                    target,
                    reason: err.to_string(),
                },
                _ => Self::io(format!("connect to {target}"), err),
            },
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Wire error code reported to the opener of a failed stream.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ConnectionRefused { .. } => ErrorCode::Refused,
            Self::Unreachable { .. } | Self::ResolveFailed { .. } => ErrorCode::Unreachable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                ErrorCode::Timeout
            }
            _ => ErrorCode::General,
        }
    }

    /// Returns `true` if this error is transient and retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::SendFailed { .. } | Self::ReceiveFailed { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if the link this error came from is unusable.
    #[must_use]
    pub const fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Self::LinkClosed
                | Self::SendFailed { .. }
                | Self::ReceiveFailed { .. }
                | Self::Framing(_)
                | Self::ShuttingDown
                | Self::Injected { .. }
        )
    }

    /// Returns `true` for dial failures.
    #[must_use]
    pub const fn is_dial_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::Unreachable { .. }
                | Self::ResolveFailed { .. }
                | Self::Timeout { .. }
        )
    }
}

// ============================================
// Error Conversions
// ============================================

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::bind_failed("127.0.0.1:8080".parse().unwrap(), "address in use");
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_connect_classification() {
        let refused = TransportError::from_connect(
            "1.2.3.4:80",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(refused.error_code(), ErrorCode::Refused);
        assert!(refused.is_dial_error());

        let timed_out = TransportError::from_connect(
            "1.2.3.4:80",
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
        );
        assert_eq!(timed_out.error_code(), ErrorCode::Timeout);

        let unreachable = TransportError::from_connect("1.2.3.4:80", io::Error::from_raw_os_error(113));
        assert_eq!(unreachable.error_code(), ErrorCode::Unreachable);
    }

    #[test]
    fn test_error_classification() {
        assert!(TransportError::LinkClosed.is_link_fatal());
        assert!(!TransportError::LinkClosed.is_retryable());
        assert!(TransportError::timeout("dial").is_retryable());
        assert_eq!(TransportError::injected("send").error_code(), ErrorCode::General);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::WouldBlock, "would block");
        let transport_err: TransportError = io_err.into();
        assert!(transport_err.is_retryable());
    }
}
