//! Signaling transport boundary
//!
//! The orchestration layer never speaks a wire protocol itself. Everything
//! that reaches the real-time voice service goes through a
//! [`SignalingTransport`]: connecting, registering, dialing, listing calls
//! and issuing per-call controls. Media (codecs, NAT traversal) lives below
//! this boundary as well.
//!
//! The layer only relies on two guarantees: `get_calls()` returns a
//! reasonably current snapshot, and call ids stay stable for a call's
//! lifetime.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────┐
//! │     SessionManager      │
//! │  registry · monitor     │
//! └───────────┬─────────────┘
//!             │  SignalingTransport (this module)
//! ┌───────────▼─────────────┐
//! │   signaling client      │  WebRTC / SIP-over-WS / ...
//! └─────────────────────────┘
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::call::{CallId, CallRecord};
use crate::config::{Headers, SessionConfig};
use crate::error::SessionResult;

pub mod loopback;

/// Push notifications from the transport's status channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new inbound call was offered to the agent
    IncomingCall(CallRecord),
    /// Status or flags of a known call changed
    CallUpdated(CallRecord),
    /// The signaling connection dropped
    Disconnected { reason: String },
}

/// An open signaling connection
#[derive(Debug)]
pub struct TransportConnection {
    /// Identifier of this connection, for logging
    pub id: Uuid,
    /// Status channel; closed when the connection goes away
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Pluggable signaling client
///
/// Implementations must be cheap to share (`Arc<dyn SignalingTransport>`)
/// and tolerate calls from several tasks at once.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Open the connection and its status channel
    async fn connect(&self, config: &SessionConfig) -> SessionResult<TransportConnection>;

    /// Register the agent, attaching custom routing headers
    async fn register(&self, headers: &Headers) -> SessionResult<()>;

    /// Withdraw the registration
    async fn unregister(&self) -> SessionResult<()>;

    /// Place an outbound call and return its id
    ///
    /// The acknowledgment may arrive before the call is visible in
    /// [`Self::get_calls`].
    async fn dial(&self, destination: &str, headers: &Headers) -> SessionResult<CallId>;

    /// Current snapshot of every call known to the service for this agent
    async fn get_calls(&self) -> SessionResult<Vec<CallRecord>>;

    /// Close the connection
    async fn logout(&self) -> SessionResult<()>;

    async fn hangup(&self, call_id: &CallId) -> SessionResult<()>;

    async fn set_mute(&self, call_id: &CallId, muted: bool) -> SessionResult<()>;

    async fn set_hold(&self, call_id: &CallId, on_hold: bool) -> SessionResult<()>;

    async fn send_dtmf(&self, call_id: &CallId, tones: &str) -> SessionResult<()>;

    async fn transfer(&self, call_id: &CallId, recipient: &str, headers: &Headers) -> SessionResult<()>;
}
