//! Error types for call-session orchestration
//!
//! Every fallible operation in this crate returns a [`SessionResult`]. The
//! variants fall into four groups, and the group decides how an error is
//! handled:
//!
//! - **Configuration** - missing or invalid credentials, malformed settings,
//!   failed credential refresh. Fatal to `initialize()`, never retried.
//! - **Transient transport** - registration timeouts, transport hiccups,
//!   dial acknowledgment delays. Retried locally with a bounded budget.
//! - **State consistency** - a control issued against a call in the wrong
//!   state, a backward status transition, an evicted handle. Rejected
//!   synchronously.
//! - **Lookup** - a dialed call never showed up in the call list.
//!
//! # Examples
//!
//! ```rust
//! use call_session_core::{SessionError, CallStatus};
//!
//! let err = SessionError::InvalidCallState {
//!     call_id: "c-1".into(),
//!     operation: "hold",
//!     status: CallStatus::None,
//! };
//! assert!(!err.is_recoverable());
//! assert_eq!(err.category(), "state");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{CallId, CallStatus};

/// Result alias used throughout the crate
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session manager, registry, monitor and call handles
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The signaling connection could not be established or registered
    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    /// Registration with the signaling service was refused or did not complete
    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// A call id is not (or no longer) known to the registry
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    /// A control was issued against a call whose status does not allow it
    #[error("Cannot {operation} call {call_id} in state {status}")]
    InvalidCallState {
        call_id: CallId,
        operation: &'static str,
        status: CallStatus,
    },

    /// A status change would move the call backward through its lifecycle
    #[error("Invalid transition for call {call_id}: {from} -> {to}")]
    InvalidTransition {
        call_id: CallId,
        from: CallStatus,
        to: CallStatus,
    },

    /// Configuration is missing or malformed
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// The credential layer could not produce a usable token
    #[error("Token refresh failed: {reason}")]
    TokenRefreshFailed { reason: String },

    /// A caller-supplied argument is malformed (destination, DTMF tone, ...)
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// The transport rejected or failed a request
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// An operation did not complete in time
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    /// The manager has no active signaling connection
    #[error("Session is not initialized")]
    NotInitialized,

    /// Anything else
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Coarse error classification carried inside [`crate::CallUpdate::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    Configuration,
    InvalidState,
    NotFound,
    Transport,
    Timeout,
    Internal,
}

impl SessionError {
    /// Build a transport error from anything printable
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Build a connection error from anything printable
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection { reason: reason.into() }
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Only transient transport conditions are recoverable. Configuration and
    /// state-consistency errors are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Transport { .. }
                | SessionError::OperationTimeout { .. }
                | SessionError::RegistrationFailed { .. }
                | SessionError::Connection { .. }
        )
    }

    /// Whether this error came from configuration or the credential layer
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidConfiguration { .. } | SessionError::TokenRefreshFailed { .. }
        )
    }

    /// Static label used as a structured log field
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::Connection { .. } | SessionError::RegistrationFailed { .. } => {
                "connection"
            }
            SessionError::InvalidConfiguration { .. } | SessionError::TokenRefreshFailed { .. } => {
                "configuration"
            }
            SessionError::InvalidCallState { .. } | SessionError::InvalidTransition { .. } => "state",
            SessionError::CallNotFound { .. } => "lookup",
            SessionError::InvalidInput { .. } => "input",
            SessionError::Transport { .. } => "transport",
            SessionError::OperationTimeout { .. } => "timeout",
            SessionError::NotInitialized => "lifecycle",
            SessionError::InternalError { .. } => "internal",
        }
    }

    /// Map onto the coarse kind delivered to call subscribers
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection { .. }
            | SessionError::RegistrationFailed { .. }
            | SessionError::NotInitialized => ErrorKind::Connection,
            SessionError::InvalidConfiguration { .. }
            | SessionError::TokenRefreshFailed { .. }
            | SessionError::InvalidInput { .. } => ErrorKind::Configuration,
            SessionError::InvalidCallState { .. } | SessionError::InvalidTransition { .. } => {
                ErrorKind::InvalidState
            }
            SessionError::CallNotFound { .. } => ErrorKind::NotFound,
            SessionError::Transport { .. } => ErrorKind::Transport,
            SessionError::OperationTimeout { .. } => ErrorKind::Timeout,
            SessionError::InternalError { .. } => ErrorKind::Internal,
        }
    }
}
