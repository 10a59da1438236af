//! Events delivered to call and session subscribers
//!
//! Per-call events are a closed tagged union, [`CallUpdate`], so every
//! consumer handles each case exhaustively:
//!
//! ```rust
//! use call_session_core::{CallUpdate, CallStatus};
//!
//! fn describe(update: &CallUpdate) -> String {
//!     match update {
//!         CallUpdate::Status(status) => format!("status is now {}", status),
//!         CallUpdate::Mute(muted) => format!("muted: {}", muted),
//!         CallUpdate::Hold(on_hold) => format!("on hold: {}", on_hold),
//!         CallUpdate::Error(kind) => format!("error: {:?}", kind),
//!     }
//! }
//!
//! assert_eq!(describe(&CallUpdate::Status(CallStatus::Ringing)), "status is now RINGING");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::CallStatus;
use crate::error::{ErrorKind, SessionError};
use crate::handle::CallHandle;

/// A change on one call, pushed to every live subscriber of its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallUpdate {
    Status(CallStatus),
    Mute(bool),
    Hold(bool),
    Error(ErrorKind),
}

/// Discriminant of a [`CallUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Status,
    Mute,
    Hold,
    Error,
}

impl CallUpdate {
    pub fn update_type(&self) -> UpdateType {
        match self {
            CallUpdate::Status(_) => UpdateType::Status,
            CallUpdate::Mute(_) => UpdateType::Mute,
            CallUpdate::Hold(_) => UpdateType::Hold,
            CallUpdate::Error(_) => UpdateType::Error,
        }
    }
}

/// Session-level notifications delivered to [`crate::SessionManager::subscribe`]
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A call handle was issued (inbound notification or dialed call)
    Call(CallHandle),
    /// The connection dropped or automatic reconnection failed
    Error(SessionError),
    /// The manager shut down; no further events follow
    Complete,
}

/// Agent availability as seen by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// No signaling connection
    Offline,
    /// `initialize()` in progress
    Connecting,
    /// Registered and ready for calls
    Available,
    /// Connection lost or post-call reconnection failed
    Degraded { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Offline => f.write_str("offline"),
            Availability::Connecting => f.write_str("connecting"),
            Availability::Available => f.write_str("available"),
            Availability::Degraded { reason } => write!(f, "degraded ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_serializes_as_type_and_value() {
        let json = serde_json::to_value(CallUpdate::Hold(true)).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "HOLD", "value": true }));

        let status = serde_json::to_value(CallUpdate::Status(CallStatus::Connected)).unwrap();
        assert_eq!(status, serde_json::json!({ "type": "STATUS", "value": "CONNECTED" }));
    }

    #[test]
    fn update_type_matches_variant() {
        assert_eq!(CallUpdate::Mute(false).update_type(), UpdateType::Mute);
        assert_eq!(CallUpdate::Error(ErrorKind::Transport).update_type(), UpdateType::Error);
    }
}
