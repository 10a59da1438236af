//! In-process loopback transport
//!
//! [`LoopbackTransport`] keeps the "remote" call list in memory and lets the
//! caller script the far end: inject inbound calls, move calls through
//! their states (visible to polling only, or pushed on the status channel),
//! drop the connection, and make `connect`/`register`/`dial`/`hangup` fail a chosen
//! number of times. It also counts connections, registrations and logouts,
//! which makes it the transport of choice for tests and demos.
//!
//! ```rust
//! use call_session_core::{LoopbackTransport, SignalingTransport, SessionConfig, CallStatus};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = LoopbackTransport::new();
//! let _conn = transport.connect(&SessionConfig::new("agent", "pw")).await?;
//! let call_id = transport.dial("+15551234567", &Default::default()).await?;
//!
//! transport.set_status(&call_id, CallStatus::Connected);
//! let calls = transport.get_calls().await?;
//! assert_eq!(calls[0].status, CallStatus::Connected);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{SignalingTransport, TransportConnection, TransportEvent};
use crate::call::{CallDirection, CallId, CallRecord, CallStatus};
use crate::config::{Headers, SessionConfig};
use crate::error::{SessionError, SessionResult};

#[derive(Default)]
struct LoopbackState {
    connection_id: Option<Uuid>,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    registered: bool,

    calls: BTreeMap<CallId, CallRecord>,
    // Dialed but not yet listed by get_calls
    hidden: BTreeMap<CallId, CallRecord>,
    hide_dialed: bool,
    next_call: u64,

    connect_failures: u32,
    register_failures: u32,
    dial_failures: u32,
    hangup_failures: u32,
    connect_error: Option<SessionError>,
    poll_delay: Option<Duration>,

    connects: u32,
    registrations: u32,
    unregistrations: u32,
    logouts: u32,
    polls: u32,
    open_connections: u32,
    peak_connections: u32,

    last_config: Option<SessionConfig>,
    register_headers: Option<Headers>,
    dial_headers: Option<Headers>,
    dtmf: Vec<(CallId, String)>,
    transfers: Vec<(CallId, String)>,
}

/// Scriptable in-memory [`SignalingTransport`]
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== SCRIPTING =====

    /// Make the next `count` connect attempts fail with a transport error
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    /// Make the next `count` registrations fail with a registration error
    pub fn fail_next_registers(&self, count: u32) {
        self.state.lock().register_failures = count;
    }

    /// Make the next `count` dial requests fail with a transport error
    pub fn fail_next_dials(&self, count: u32) {
        self.state.lock().dial_failures = count;
    }

    /// Make the next `count` hangup requests fail with a transport error
    pub fn fail_next_hangups(&self, count: u32) {
        self.state.lock().hangup_failures = count;
    }

    /// Reject every connect with `error` until cleared with `None`
    pub fn reject_connects_with(&self, error: Option<SessionError>) {
        self.state.lock().connect_error = error;
    }

    /// Acknowledge dials without listing the call until [`Self::reveal`]
    pub fn hide_dialed_calls(&self, hide: bool) {
        self.state.lock().hide_dialed = hide;
    }

    /// Delay every `get_calls` response
    pub fn set_poll_delay(&self, delay: Option<Duration>) {
        self.state.lock().poll_delay = delay;
    }

    /// Start listing a hidden dialed call
    pub fn reveal(&self, call_id: &CallId) -> bool {
        let mut state = self.state.lock();
        match state.hidden.remove(call_id) {
            Some(record) => {
                state.calls.insert(call_id.clone(), record);
                true
            }
            None => false,
        }
    }

    /// Change a call's remote status; observable by polling only
    pub fn set_status(&self, call_id: &CallId, status: CallStatus) -> bool {
        let mut state = self.state.lock();
        match state.calls.get_mut(call_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Change a call's remote status and push it on the status channel
    pub fn push_status(&self, call_id: &CallId, status: CallStatus) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.calls.get_mut(call_id) else {
            return false;
        };
        record.status = status;
        let record = record.clone();
        Self::emit(&state, TransportEvent::CallUpdated(record));
        true
    }

    /// Offer an inbound call to the agent
    pub fn inject_incoming(&self, from: &str) -> CallId {
        let mut state = self.state.lock();
        let call_id = Self::next_id(&mut state, "in");
        let record = CallRecord::new(call_id.clone(), from, CallDirection::Inbound, CallStatus::Ringing);
        state.calls.insert(call_id.clone(), record.clone());
        Self::emit(&state, TransportEvent::IncomingCall(record));
        call_id
    }

    /// Drop the current call list entry without notifying anyone
    pub fn remove_call(&self, call_id: &CallId) -> bool {
        self.state.lock().calls.remove(call_id).is_some()
    }

    /// Simulate the service dropping the connection
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.state.lock();
        Self::emit(&state, TransportEvent::Disconnected { reason: reason.to_string() });
        state.events_tx = None;
    }

    // ===== INSPECTION =====

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.values().cloned().collect()
    }

    pub fn call(&self, call_id: &CallId) -> Option<CallRecord> {
        self.state.lock().calls.get(call_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection_id.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn registration_count(&self) -> u32 {
        self.state.lock().registrations
    }

    pub fn unregistration_count(&self) -> u32 {
        self.state.lock().unregistrations
    }

    pub fn logout_count(&self) -> u32 {
        self.state.lock().logouts
    }

    pub fn poll_count(&self) -> u32 {
        self.state.lock().polls
    }

    /// Connections opened and not yet logged out
    pub fn open_connections(&self) -> u32 {
        self.state.lock().open_connections
    }

    /// Highest number of simultaneously open connections ever observed
    pub fn peak_connections(&self) -> u32 {
        self.state.lock().peak_connections
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.state.lock().last_config.clone()
    }

    pub fn register_headers(&self) -> Option<Headers> {
        self.state.lock().register_headers.clone()
    }

    pub fn dial_headers(&self) -> Option<Headers> {
        self.state.lock().dial_headers.clone()
    }

    pub fn dtmf_sent(&self) -> Vec<(CallId, String)> {
        self.state.lock().dtmf.clone()
    }

    pub fn transfers(&self) -> Vec<(CallId, String)> {
        self.state.lock().transfers.clone()
    }

    // ===== INTERNALS =====

    fn next_id(state: &mut LoopbackState, prefix: &str) -> CallId {
        state.next_call += 1;
        CallId::new(format!("{}-{}", prefix, state.next_call))
    }

    fn emit(state: &LoopbackState, event: TransportEvent) {
        if let Some(tx) = &state.events_tx {
            if tx.send(event).is_err() {
                trace!("Loopback status channel has no receiver");
            }
        }
    }

    fn ensure_connected(state: &LoopbackState) -> SessionResult<()> {
        if state.connection_id.is_none() {
            return Err(SessionError::transport("loopback transport is not connected"));
        }
        Ok(())
    }

    fn with_call<T>(
        &self,
        call_id: &CallId,
        f: impl FnOnce(&mut LoopbackState, &mut CallRecord) -> T,
    ) -> SessionResult<T> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        let mut record = state
            .calls
            .get(call_id)
            .cloned()
            .ok_or_else(|| SessionError::transport(format!("unknown call {}", call_id)))?;
        let out = f(&mut state, &mut record);
        state.calls.insert(call_id.clone(), record);
        Ok(out)
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn connect(&self, config: &SessionConfig) -> SessionResult<TransportConnection> {
        let mut state = self.state.lock();
        if let Some(error) = &state.connect_error {
            return Err(error.clone());
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(SessionError::transport("connection refused (scripted)"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        state.connection_id = Some(id);
        state.events_tx = Some(tx);
        state.connects += 1;
        state.open_connections += 1;
        state.peak_connections = state.peak_connections.max(state.open_connections);
        state.last_config = Some(config.clone());
        debug!(connection_id = %id, username = %config.username, "Loopback connected");

        Ok(TransportConnection { id, events: rx })
    }

    async fn register(&self, headers: &Headers) -> SessionResult<()> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        if state.register_failures > 0 {
            state.register_failures -= 1;
            return Err(SessionError::RegistrationFailed {
                reason: "registrar did not answer (scripted)".to_string(),
            });
        }
        state.registered = true;
        state.registrations += 1;
        state.register_headers = Some(headers.clone());
        Ok(())
    }

    async fn unregister(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        if state.registered {
            state.registered = false;
            state.unregistrations += 1;
        }
        Ok(())
    }

    async fn dial(&self, destination: &str, headers: &Headers) -> SessionResult<CallId> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(SessionError::transport("dial not acknowledged (scripted)"));
        }

        let call_id = Self::next_id(&mut state, "out");
        let record = CallRecord::new(
            call_id.clone(),
            destination,
            CallDirection::Outbound,
            CallStatus::Connecting,
        );
        if state.hide_dialed {
            state.hidden.insert(call_id.clone(), record);
        } else {
            state.calls.insert(call_id.clone(), record);
        }
        state.dial_headers = Some(headers.clone());
        Ok(call_id)
    }

    async fn get_calls(&self) -> SessionResult<Vec<CallRecord>> {
        let delay = {
            let mut state = self.state.lock();
            Self::ensure_connected(&state)?;
            state.polls += 1;
            state.poll_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.calls())
    }

    async fn logout(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        if let Some(id) = state.connection_id.take() {
            debug!(connection_id = %id, "Loopback logged out");
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        state.logouts += 1;
        state.registered = false;
        state.events_tx = None;
        state.calls.clear();
        state.hidden.clear();
        Ok(())
    }

    async fn hangup(&self, call_id: &CallId) -> SessionResult<()> {
        {
            let mut state = self.state.lock();
            if state.hangup_failures > 0 {
                state.hangup_failures -= 1;
                return Err(SessionError::transport("hangup not acknowledged (scripted)"));
            }
        }
        self.with_call(call_id, |_, record| {
            record.status = CallStatus::Terminated;
        })
    }

    async fn set_mute(&self, call_id: &CallId, muted: bool) -> SessionResult<()> {
        self.with_call(call_id, |_, record| {
            record.muted = muted;
        })
    }

    async fn set_hold(&self, call_id: &CallId, on_hold: bool) -> SessionResult<()> {
        self.with_call(call_id, |_, record| {
            record.on_hold = on_hold;
        })
    }

    async fn send_dtmf(&self, call_id: &CallId, tones: &str) -> SessionResult<()> {
        self.with_call(call_id, |state, record| {
            state.dtmf.push((record.id.clone(), tones.to_string()));
        })
    }

    async fn transfer(&self, call_id: &CallId, recipient: &str, _headers: &Headers) -> SessionResult<()> {
        self.with_call(call_id, |state, record| {
            record.status = CallStatus::Transferring;
            state.transfers.push((record.id.clone(), recipient.to_string()));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("agent", "pw")
    }

    #[tokio::test]
    async fn calls_are_invisible_without_connection() {
        let transport = LoopbackTransport::new();
        assert!(transport.get_calls().await.is_err());
        assert!(transport.dial("+15551234567", &Headers::new()).await.is_err());
    }

    #[tokio::test]
    async fn logout_closes_status_channel_and_clears_calls() {
        let transport = LoopbackTransport::new();
        let mut conn = transport.connect(&config()).await.unwrap();
        transport.dial("+15551234567", &Headers::new()).await.unwrap();
        assert_eq!(transport.open_connections(), 1);

        transport.logout().await.unwrap();
        assert_eq!(transport.open_connections(), 0);
        assert!(transport.calls().is_empty());
        assert!(conn.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn inbound_calls_are_pushed() {
        let transport = LoopbackTransport::new();
        let mut conn = transport.connect(&config()).await.unwrap();
        let id = transport.inject_incoming("+15550001111");

        match conn.events.recv().await {
            Some(TransportEvent::IncomingCall(record)) => {
                assert_eq!(record.id, id);
                assert_eq!(record.direction, CallDirection::Inbound);
                assert_eq!(record.status, CallStatus::Ringing);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let transport = LoopbackTransport::new();
        transport.fail_next_connects(1);
        assert!(transport.connect(&config()).await.is_err());
        assert!(transport.connect(&config()).await.is_ok());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn hidden_dials_appear_after_reveal() {
        let transport = LoopbackTransport::new();
        let _conn = transport.connect(&config()).await.unwrap();
        transport.hide_dialed_calls(true);
        let id = transport.dial("+15551234567", &Headers::new()).await.unwrap();
        assert!(transport.get_calls().await.unwrap().is_empty());

        assert!(transport.reveal(&id));
        assert_eq!(transport.get_calls().await.unwrap().len(), 1);
    }

    #[test]
    fn controls_update_remote_record() {
        let transport = LoopbackTransport::new();
        let id = tokio_test::block_on(async {
            let _conn = transport.connect(&config()).await.unwrap();
            let id = transport.dial("+15551234567", &Headers::new()).await.unwrap();
            transport.set_hold(&id, true).await.unwrap();
            transport.set_mute(&id, true).await.unwrap();
            id
        });

        let record = transport.call(&id).unwrap();
        assert!(record.on_hold);
        assert!(record.muted);
        assert!(tokio_test::block_on(transport.set_hold(&"nope".into(), true)).is_err());
    }
}
