//! Call identifiers, the call status state machine and call snapshots
//!
//! # State machine
//!
//! ```text
//! NONE → CONNECTING → RINGING → CONNECTED ─┬─► TRANSFERRING → TRANSFERRED ─┐
//!                                          └─► TERMINATING ────────────────┴─► TERMINATED
//! ```
//!
//! Early states may skip ahead (`CONNECTING → CONNECTED` when the far end
//! answers without ringing), any live state may jump straight to
//! `TERMINATING` or `TERMINATED`, and `TERMINATED` accepts nothing.
//! `CONNECTED` may re-enter itself; hold and mute toggle flags, not status.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque call identifier assigned by the transport
///
/// Stable for the lifetime of one call. Registry entries are keyed by this
/// id rather than by phone number, so two concurrent calls to the same
/// number stay distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Top-level status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    None,
    Connecting,
    Ringing,
    Connected,
    Transferring,
    Transferred,
    Terminating,
    Terminated,
}

impl CallStatus {
    fn rank(self) -> u8 {
        match self {
            CallStatus::None => 0,
            CallStatus::Connecting => 1,
            CallStatus::Ringing => 2,
            CallStatus::Connected => 3,
            CallStatus::Transferring => 4,
            CallStatus::Transferred => 5,
            CallStatus::Terminating => 6,
            CallStatus::Terminated => 7,
        }
    }

    /// `TERMINATED` is the only state with no way out
    pub fn is_terminal(self) -> bool {
        self == CallStatus::Terminated
    }

    /// `TERMINATING` or `TERMINATED`
    pub fn is_ending(self) -> bool {
        matches!(self, CallStatus::Terminating | CallStatus::Terminated)
    }

    /// Whether moving from `self` to `next` is a legal forward step
    ///
    /// Same-status observations other than `CONNECTED` re-entry return
    /// `false`; callers treat them as no-ops rather than errors.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;

        if self == Terminated {
            return false;
        }
        if self == next {
            return self == Connected;
        }
        match next {
            Terminated => true,
            Terminating => self.rank() < Terminating.rank(),
            Transferring => self == Connected,
            Transferred => self == Transferring,
            None => false,
            Connecting | Ringing | Connected => {
                self.rank() < Connected.rank() && next.rank() > self.rank()
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::None => "NONE",
            CallStatus::Connecting => "CONNECTING",
            CallStatus::Ringing => "RINGING",
            CallStatus::Connected => "CONNECTED",
            CallStatus::Transferring => "TRANSFERRING",
            CallStatus::Transferred => "TRANSFERRED",
            CallStatus::Terminating => "TERMINATING",
            CallStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// One remote call as reported by the transport
///
/// Produced by [`crate::SignalingTransport::get_calls`] and by inbound push
/// notifications. The registry turns the first observation of an id into a
/// [`crate::CallHandle`]; later observations only update status and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub status: CallStatus,
    /// Originating number for inbound calls, terminating number for outbound
    pub number: String,
    pub direction: CallDirection,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub on_hold: bool,
}

impl CallRecord {
    pub fn new(
        id: impl Into<CallId>,
        number: impl Into<String>,
        direction: CallDirection,
        status: CallStatus,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            number: number.into(),
            direction,
            muted: false,
            on_hold: false,
        }
    }
}

/// Read-only projection of a live call, returned by [`crate::CallHandle::info`]
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub number: String,
    pub status: CallStatus,
    pub muted: bool,
    pub on_hold: bool,
    /// Accumulated time per duration category ("ringing", "connected", ...)
    pub durations: HashMap<String, Duration>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_accepted() {
        let path = [
            CallStatus::None,
            CallStatus::Connecting,
            CallStatus::Ringing,
            CallStatus::Connected,
            CallStatus::Transferring,
            CallStatus::Transferred,
            CallStatus::Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(CallStatus::Connected.can_transition_to(CallStatus::Terminating));
        assert!(CallStatus::Terminating.can_transition_to(CallStatus::Terminated));
    }

    #[test]
    fn backward_steps_are_rejected() {
        assert!(!CallStatus::Connected.can_transition_to(CallStatus::Ringing));
        assert!(!CallStatus::Terminating.can_transition_to(CallStatus::Connected));
        assert!(!CallStatus::Transferred.can_transition_to(CallStatus::Transferring));
        assert!(!CallStatus::Ringing.can_transition_to(CallStatus::None));
    }

    #[test]
    fn terminated_is_a_sink() {
        for next in [
            CallStatus::None,
            CallStatus::Connecting,
            CallStatus::Connected,
            CallStatus::Terminating,
            CallStatus::Terminated,
        ] {
            assert!(!CallStatus::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn connected_may_reenter_itself() {
        assert!(CallStatus::Connected.can_transition_to(CallStatus::Connected));
        assert!(!CallStatus::Ringing.can_transition_to(CallStatus::Ringing));
    }

    #[test]
    fn early_states_may_skip_ahead() {
        assert!(CallStatus::Connecting.can_transition_to(CallStatus::Connected));
        assert!(CallStatus::None.can_transition_to(CallStatus::Terminated));
        assert!(!CallStatus::Ringing.can_transition_to(CallStatus::Transferring));
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_string(&CallStatus::Terminating).unwrap();
        assert_eq!(json, "\"TERMINATING\"");
    }
}
