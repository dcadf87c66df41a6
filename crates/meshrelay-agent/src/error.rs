// ============================================
// File: crates/meshrelay-agent/src/error.rs
// ============================================
//! # Agent Error Types
//!
//! ## Creation Reason
//! One error type for everything the agent does: configuration, routing,
//! stream admission, peer management and the failures surfaced through
//! the ingress API.
//!
//! ## Main Functionality
//! - `AgentError` wrapping the lower-layer error types
//! - `error_code()`: wire code sent in `*_OPEN_ERR` / `STREAM_RESET`
//! - Classifiers used by the orchestrator and the CLI
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every open failure MUST map to a specific `ErrorCode`; `General` is
//!   for genuinely unclassified failures only
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use meshrelay_common::error::CommonError;
use meshrelay_common::{AgentId, Cidr};
use meshrelay_core::error::CoreError;
use meshrelay_core::protocol::ErrorCode;
use meshrelay_transport::error::TransportError;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types.
#[derive(Error, Debug)]
pub enum AgentError {
    // ========================================
    // Configuration
    // ========================================

    /// Configuration file unreadable or unparsable.
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        /// File path
        path: String,
        /// Why loading failed
        reason: String,
    },

    /// Configuration value out of range.
    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// Identity file unreadable, unwritable or corrupt.
    #[error("Identity file '{path}': {reason}")]
    Identity {
        /// File path
        path: String,
        /// What went wrong
        reason: String,
    },

    // ========================================
    // Routing
    // ========================================

    /// No route covers the destination.
    #[error("No route to {destination}")]
    NoRoute {
        /// Destination as text
        destination: String,
    },

    /// Nothing stored for the prefix.
    #[error("Route not found: {prefix}")]
    RouteNotFound {
        /// Requested prefix
        prefix: Cidr,
    },

    /// Route rejected by the table.
    #[error("Invalid route: {reason}")]
    InvalidRoute {
        /// Why it was rejected
        reason: String,
    },

    // ========================================
    // Streams & Associations
    // ========================================

    /// An admission limit was hit.
    #[error("Resource limit reached: {resource} (max {limit})")]
    ResourceLimit {
        /// Which limit
        resource: &'static str,
        /// Configured value
        limit: usize,
    },

    /// The far end rejected an open request.
    #[error("Open rejected ({code}): {message}")]
    OpenRejected {
        /// Code reported by the rejecting hop
        code: ErrorCode,
        /// Message reported by the rejecting hop
        message: String,
    },

    /// No answer to an open request in time.
    #[error("Open timed out")]
    OpenTimeout,

    /// Stream was reset.
    #[error("Stream reset: {code}")]
    StreamReset {
        /// Reset reason
        code: ErrorCode,
    },

    /// A peer broke the frame protocol.
    #[error("Protocol violation: {reason}")]
    Protocol {
        /// What was violated
        reason: String,
    },

    // ========================================
    // Peers
    // ========================================

    /// No attached peer with this id.
    #[error("Peer not found: {0}")]
    PeerNotFound(AgentId),

    /// A link for this agent is already attached.
    #[error("Peer already attached: {0}")]
    PeerExists(AgentId),

    /// The peer's send queue stayed full for the whole wait.
    #[error("Peer queue full: {0}")]
    PeerCongested(AgentId),

    /// Link handshake failed.
    #[error("Peer handshake failed: {reason}")]
    PeerHandshake {
        /// Why
        reason: String,
    },

    // ========================================
    // Lifecycle
    // ========================================

    /// Agent failed to start.
    #[error("Agent failed to start: {reason}")]
    StartupFailed {
        /// Why
        reason: String,
    },

    /// Agent is shutting down.
    #[error("Agent is shutting down")]
    ShuttingDown,

    /// Internal invariant broken.
    #[error("Internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },

    // ========================================
    // Wrapped Errors
    // ========================================

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Error from core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Error from transport crate.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Creates a `ConfigLoad` error.
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConfigInvalid` error.
    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Identity` error.
    pub fn identity(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Identity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `NoRoute` error.
    pub fn no_route(destination: impl ToString) -> Self {
        Self::NoRoute {
            destination: destination.to_string(),
        }
    }

    /// Creates a `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Creates a `StartupFailed` error.
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire error code for this failure.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoRoute { .. } => ErrorCode::NoRoute,
            Self::ResourceLimit { .. } => ErrorCode::ResourceLimit,
            Self::OpenRejected { code, .. } | Self::StreamReset { code } => *code,
            Self::OpenTimeout | Self::PeerCongested(_) => ErrorCode::Timeout,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::PeerNotFound(_) => ErrorCode::PeerLost,
            Self::ShuttingDown => ErrorCode::Cancelled,
            Self::Transport(e) => e.error_code(),
            Self::Core(e) if e.is_crypto_error() => ErrorCode::DecryptFailed,
            Self::Core(e) if e.is_malformed() => ErrorCode::Protocol,
            _ => ErrorCode::General,
        }
    }

    /// Returns `true` for configuration problems.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns `true` if the agent cannot continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. }
                | Self::ConfigInvalid { .. }
                | Self::Identity { .. }
                | Self::StartupFailed { .. }
        )
    }

    /// Returns `true` if the caller may retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::ResourceLimit { .. } | Self::OpenTimeout => true,
            Self::OpenRejected { code, .. } => {
                matches!(code, ErrorCode::ResourceLimit | ErrorCode::Timeout)
            }
            _ => false,
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
        let err = AgentError::config_load("/etc/meshrelay/agent.toml", "file not found");
        assert!(err.to_string().contains("/etc/meshrelay/agent.toml"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AgentError::no_route("1.2.3.4").error_code(), ErrorCode::NoRoute);
        assert_eq!(
            AgentError::ResourceLimit {
                resource: "streams",
                limit: 1
            }
            .error_code(),
            ErrorCode::ResourceLimit
        );
        assert_eq!(AgentError::OpenTimeout.error_code(), ErrorCode::Timeout);
        assert_eq!(
            AgentError::Core(CoreError::Decryption).error_code(),
            ErrorCode::DecryptFailed
        );
        assert_eq!(
            AgentError::Core(CoreError::UnknownType(0x77)).error_code(),
            ErrorCode::Protocol
        );
        let refused = TransportError::ConnectionRefused {
            target: "x".into(),
        };
        assert_eq!(AgentError::from(refused).error_code(), ErrorCode::Refused);
    }

    #[test]
    fn test_error_classification() {
        let config_err = AgentError::config_invalid("limits.max_streams_total", "must be > 0");
        assert!(config_err.is_config_error());
        assert!(config_err.is_fatal());
        assert!(AgentError::OpenTimeout.is_retryable());
        assert!(!AgentError::no_route("x").is_retryable());
    }
}
