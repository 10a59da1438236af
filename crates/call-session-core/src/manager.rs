//! Session manager: connection lifecycle and the entry point for dialing
//!
//! [`SessionManager`] owns the signaling connection of one agent. It is an
//! ordinary value injected with its transport, so several independent
//! managers can live in one process (and in one test binary).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── SessionManager ────────────────────────────┐
//! │                                                                        │
//! │  initialize / make_call / logout / shutdown       subscribe(..)        │
//! │        │                                               ▲               │
//! │        ▼                                               │ SessionEvent  │
//! │  ┌───────────┐   observe    ┌──────────────┐   Call    │               │
//! │  │  monitor  │─────────────►│   registry   │───────────┘               │
//! │  └───────────┘              └──────┬───────┘                           │
//! │        ▲  poll                     │ CallEnded                         │
//! │        │           ┌───────────────▼──────────┐                        │
//! │        │           │ lifecycle loop           │ evict, then reconnect  │
//! │        │           └──────────────────────────┘ with the last config   │
//! │  ┌─────┴──────────────────────────────────────────────┐                │
//! │  │ SignalingTransport  (push events ─► inbound pump)  │                │
//! │  └────────────────────────────────────────────────────┘                │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All background work (monitor, inbound pump, lifecycle loop, deferred
//! cleanups) runs on the manager's [`Supervisor`]. Per-connection tasks run
//! on a child supervisor that is cancelled on logout.
//!
//! # Automatic reconnection
//!
//! When a call reaches `TERMINATED` the lifecycle loop first evicts it from
//! the registry, then (once no other call is live) logs out and initializes
//! again with the last configuration, retrying with backoff. A failed
//! reconnection never panics: it is logged, the availability signal turns
//! [`Availability::Degraded`], and observers receive
//! [`SessionEvent::Error`]. An explicit [`SessionManager::logout`] forgets the
//! configuration and so disables reconnection.
//!
//! Dialing and reconnection never overlap: [`SessionManager::make_call`]
//! waits for queued reconnections to finish, and a reconnection that finds a
//! live call once it gets its turn is deferred until that call ends.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use call_session_core::{LoopbackTransport, ManagerSettings, SessionConfig, SessionManager};
//!
//! # async fn example() -> call_session_core::SessionResult<()> {
//! let transport = Arc::new(LoopbackTransport::new());
//! let manager = SessionManager::new(transport, ManagerSettings::default());
//!
//! manager.initialize(SessionConfig::new("agent-42", "secret")).await?;
//! let call = manager.make_call("+1 (555) 123-4567").await?;
//! println!("dialed {} -> {}", call.id(), call.number());
//!
//! call.hangup().await?;
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::call::CallId;
use crate::config::{normalize_destination, ManagerSettings, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::{Availability, SessionEvent};
use crate::handle::{CallContext, CallHandle};
use crate::monitor::{CallMonitor, LifecycleSignal};
use crate::recovery::{retry_with_backoff, with_timeout, ErrorContext};
use crate::registry::CallRegistry;
use crate::subscribers::Subscription;
use crate::supervisor::Supervisor;
use crate::transport::{SignalingTransport, TransportConnection, TransportEvent};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Point-in-time session statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    /// Calls currently in the registry
    pub active_calls: usize,
    /// Call handles issued since the manager was created
    pub total_calls: u64,
    /// Successful automatic reconnections
    pub reconnects: u64,
    /// Automatic reconnections that gave up
    pub reconnect_failures: u64,
    pub connection_id: Option<Uuid>,
}

struct ActiveConnection {
    id: Uuid,
    supervisor: Supervisor,
    connected_at: DateTime<Utc>,
}

pub struct SessionManager {
    transport: Arc<dyn SignalingTransport>,
    settings: ManagerSettings,
    supervisor: Supervisor,
    context: Arc<CallContext>,
    registry: Arc<CallRegistry>,
    monitor: CallMonitor,

    /// Serializes initialize, logout and dialing
    init_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<ActiveConnection>>,
    state: Mutex<SessionState>,
    last_config: Mutex<Option<SessionConfig>>,
    availability: Arc<watch::Sender<Availability>>,

    reconnects: AtomicU64,
    reconnect_failures: AtomicU64,
}

impl SessionManager {
    /// Create a manager and start its lifecycle loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn SignalingTransport>, settings: ManagerSettings) -> Arc<Self> {
        let supervisor = Supervisor::new("session");
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let context = Arc::new(CallContext::new(transport.clone(), signals, settings.callback_budget));
        let registry = Arc::new(CallRegistry::new(
            context.clone(),
            supervisor.child("registry"),
            settings.eviction_grace,
        ));
        let monitor = CallMonitor::new(
            context.monitor.clone(),
            registry.clone(),
            transport.clone(),
            settings.poll_interval,
        );
        let (availability, _) = watch::channel(Availability::Offline);

        let manager = Arc::new(Self {
            transport,
            settings,
            supervisor: supervisor.clone(),
            context,
            registry,
            monitor,
            init_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            state: Mutex::new(SessionState::Uninitialized),
            last_config: Mutex::new(None),
            availability: Arc::new(availability),
            reconnects: AtomicU64::new(0),
            reconnect_failures: AtomicU64::new(0),
        });

        supervisor.spawn(
            "lifecycle",
            run_lifecycle(Arc::downgrade(&manager), signal_rx, supervisor.token()),
        );
        manager
    }

    // ===== CONNECTION LIFECYCLE =====

    /// Connect and register with `config`
    ///
    /// An existing connection is logged out first, so there is never more
    /// than one. Concurrent calls are serialized. Configuration errors are
    /// returned as-is and never retried; anything else that prevents
    /// registration surfaces as [`SessionError::Connection`].
    pub async fn initialize(&self, config: SessionConfig) -> SessionResult<()> {
        config.validate()?;
        self.establish(config, false).await.map(|_| ())
    }

    /// Log out and forget the configuration
    ///
    /// Always succeeds. Transport failures during logout are logged and the
    /// manager ends up `Uninitialized` regardless.
    pub async fn logout(&self) -> SessionResult<()> {
        let _guard = self.init_lock.lock().await;
        let had_config = self.last_config.lock().take().is_some();
        self.teardown().await;
        if had_config {
            info!("Session logged out");
        }
        Ok(())
    }

    /// Log out, stop every background task and notify observers
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.logout().await?;
        let clean = self.supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
        self.context.observers.dispatch(&SessionEvent::Complete);
        self.context.observers.clear();
        info!(clean = clean, "Session manager shut down");
        Ok(())
    }

    // ===== CALLS =====

    /// Dial `destination` and return the call's handle
    ///
    /// The destination is normalized first (see
    /// [`crate::normalize_destination`]). The dialed call becomes the
    /// monitored call. Fails with [`SessionError::CallNotFound`] if the call
    /// does not show up in the registry within the lookup budget.
    ///
    /// A reconnection queued by a call that just ended completes before the
    /// dial is issued, and no reconnection can start while the dial is in
    /// flight.
    pub async fn make_call(&self, destination: &str) -> SessionResult<CallHandle> {
        let destination = normalize_destination(destination)?;

        let token = self.supervisor.token();
        tokio::select! {
            _ = token.cancelled() => return Err(shut_down()),
            _ = self.context.settled() => {}
        }
        let _guard = self.init_lock.lock().await;

        let supervisor = match self.connection.lock().as_ref() {
            Some(connection) => connection.supervisor.clone(),
            None => return Err(SessionError::NotInitialized),
        };
        let headers = self
            .last_config
            .lock()
            .as_ref()
            .map(|config| config.custom_headers.clone())
            .unwrap_or_default();

        let transport = &self.transport;
        let (target, headers_ref) = (destination.as_str(), &headers);
        let call_id = retry_with_backoff("dial", self.settings.dial_retry.clone(), || {
            transport.dial(target, headers_ref)
        })
        .await
        .with_context(|| format!("dialing {}", destination))?;
        info!(call_id = %call_id, destination = %destination, "Dialed outbound call");

        self.monitor.start(call_id.clone(), &supervisor);

        match self
            .registry
            .wait_for(&call_id, self.settings.call_lookup_attempts, self.settings.call_lookup_delay)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.context.monitor.stop_if(&call_id);
                warn!(call_id = %call_id, "Dialed call never appeared in the call list");
                Err(e)
            }
        }
    }

    pub fn call(&self, call_id: &CallId) -> Option<CallHandle> {
        self.registry.get(call_id)
    }

    pub fn active_calls(&self) -> Vec<CallHandle> {
        self.registry.handles()
    }

    // ===== OBSERVATION =====

    /// Register session observers
    ///
    /// `on_call` fires for every newly issued handle (inbound or dialed),
    /// `on_error` for connection loss and failed reconnection, and
    /// `on_complete` once on shutdown.
    pub fn subscribe<C, E, D>(&self, on_call: C, on_error: E, on_complete: D) -> Subscription
    where
        C: Fn(CallHandle) + Send + Sync + 'static,
        E: Fn(&SessionError) + Send + Sync + 'static,
        D: Fn() + Send + Sync + 'static,
    {
        self.subscribe_events(move |event: &SessionEvent| match event {
            SessionEvent::Call(handle) => on_call(handle.clone()),
            SessionEvent::Error(error) => on_error(error),
            SessionEvent::Complete => on_complete(),
        })
    }

    /// Register a single callback for every [`SessionEvent`]
    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.context.observers.subscribe(Arc::new(callback))
    }

    pub fn availability(&self) -> watch::Receiver<Availability> {
        self.availability.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connection.lock().as_ref().map(|c| c.connected_at)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            active_calls: self.registry.len(),
            total_calls: self.registry.total_inserted(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_failures: self.reconnect_failures.load(Ordering::Relaxed),
            connection_id: self.connection.lock().as_ref().map(|c| c.id),
        }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &CallMonitor {
        &self.monitor
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ===== INTERNALS =====

    /// Returns `false` when a reconnection was skipped because a call
    /// became live while it was waiting
    async fn establish(&self, config: SessionConfig, reconnect: bool) -> SessionResult<bool> {
        let _guard = self.init_lock.lock().await;
        if self.supervisor.is_cancelled() {
            return Err(shut_down());
        }
        // logout() ran while this reconnection was waiting
        if reconnect && self.last_config.lock().is_none() {
            return Err(SessionError::NotInitialized);
        }
        if reconnect && !self.registry.is_empty() {
            return Ok(false);
        }
        let connected = self.connection.lock().is_some();
        if connected {
            info!("Active connection found, logging out before reconnecting");
            self.teardown().await;
        }

        *self.state.lock() = SessionState::Initializing;
        publish(&self.availability, Availability::Connecting);
        info!(username = %config.username, reconnect = reconnect, "Initializing session");

        let result = retry_with_backoff("connect", self.settings.connect_retry.clone(), || {
            self.connect_once(&config)
        })
        .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                *self.state.lock() = SessionState::Uninitialized;
                publish(&self.availability, Availability::Offline);
                error!(username = %config.username, error = %e, "Session initialization failed");
                return Err(into_connection_error(e));
            }
        };

        let connection_id = connection.id;
        let supervisor = self.supervisor.child("connection");
        let pump = InboundPump {
            registry: self.registry.clone(),
            context: self.context.clone(),
            availability: self.availability.clone(),
            token: supervisor.token(),
        };
        supervisor.spawn("inbound-pump", pump.run(connection));

        *self.connection.lock() = Some(ActiveConnection {
            id: connection_id,
            supervisor,
            connected_at: Utc::now(),
        });
        *self.last_config.lock() = Some(config);
        *self.state.lock() = SessionState::Ready;
        publish(&self.availability, Availability::Available);
        info!(connection_id = %connection_id, "Session initialized");
        Ok(true)
    }

    async fn connect_once(&self, config: &SessionConfig) -> SessionResult<TransportConnection> {
        let connection = self.transport.connect(config).await?;
        let registered = with_timeout(
            "register",
            self.settings.register_timeout,
            self.transport.register(&config.custom_headers),
        )
        .await;

        match registered {
            Ok(()) => Ok(connection),
            Err(e) => {
                // Do not leave a half-open connection behind for the next attempt
                if let Err(logout_error) = self.transport.logout().await {
                    debug!(error = %logout_error, "Logout after failed registration also failed");
                }
                Err(match e {
                    SessionError::Transport { reason } => SessionError::RegistrationFailed { reason },
                    other => other,
                })
            }
        }
    }

    /// Stop monitoring, close the connection and evict every call
    async fn teardown(&self) {
        self.context.monitor.stop();
        let connection = self.connection.lock().take();

        if let Some(connection) = connection {
            connection.supervisor.cancel();
            if let Err(e) = self.transport.unregister().await {
                debug!(error = %e, "Unregister failed during logout");
            }
            if let Err(e) = self.transport.logout().await {
                warn!(error = %e, "Transport logout failed, continuing");
            }
            info!(connection_id = %connection.id, "Closed signaling connection");
        }

        self.registry.clear();
        *self.state.lock() = SessionState::Uninitialized;
        publish(&self.availability, Availability::Offline);
    }

    async fn handle_signal(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::CallEnded(call_id) => {
                if self.registry.remove(&call_id).is_none() {
                    debug!(call_id = %call_id, "Call already evicted");
                    return;
                }
                self.context.monitor.stop_if(&call_id);

                if !self.registry.is_empty() {
                    info!(
                        call_id = %call_id,
                        remaining = self.registry.len(),
                        "Deferring reconnection until remaining calls end"
                    );
                    return;
                }
                let Some(config) = self.last_config.lock().clone() else {
                    debug!(call_id = %call_id, "No remembered configuration, skipping reconnection");
                    return;
                };
                self.reconnect(config).await;
            }
            LifecycleSignal::ResumeMonitoring(call_id) => {
                let Some(handle) = self.registry.get(&call_id) else {
                    return;
                };
                if handle.status().is_ending() || self.monitor.is_running() {
                    debug!(call_id = %call_id, "Not resuming call monitor");
                    return;
                }
                let supervisor = match self.connection.lock().as_ref() {
                    Some(connection) => connection.supervisor.clone(),
                    None => return,
                };
                info!(call_id = %call_id, "Resuming call monitor after failed hangup");
                self.monitor.start(call_id, &supervisor);
            }
        }
    }

    async fn reconnect(&self, config: SessionConfig) {
        info!(username = %config.username, "Re-initializing session after call ended");
        let result = retry_with_backoff("reconnect", self.settings.reconnect_retry.clone(), || {
            self.establish(config.clone(), true)
        })
        .await;

        match result {
            Ok(true) => {
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                info!("Automatic reconnection succeeded");
            }
            Ok(false) => {
                info!("Reconnection deferred, a call became live");
            }
            Err(SessionError::NotInitialized) => {
                info!("Automatic reconnection abandoned after logout");
            }
            Err(e) => {
                self.reconnect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, category = e.category(), "Automatic reconnection failed");
                let reason = e.to_string();
                self.context.observers.dispatch(&SessionEvent::Error(e));
                publish(&self.availability, Availability::Degraded { reason });
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.supervisor.cancel();
    }
}

fn into_connection_error(error: SessionError) -> SessionError {
    match error {
        e if e.is_configuration() => e,
        e @ (SessionError::Connection { .. } | SessionError::NotInitialized | SessionError::InternalError { .. }) => e,
        other => SessionError::Connection { reason: other.to_string() },
    }
}

fn shut_down() -> SessionError {
    SessionError::InternalError {
        message: "session manager has been shut down".to_string(),
    }
}

fn publish(sender: &watch::Sender<Availability>, next: Availability) {
    let previous = sender.send_replace(next.clone());
    if previous != next {
        info!(availability = %next, "Availability changed");
    }
}

async fn run_lifecycle(
    manager: std::sync::Weak<SessionManager>,
    mut signals: mpsc::UnboundedReceiver<LifecycleSignal>,
    token: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = manager.handle_signal(signal) => {}
        }
        manager.context.signal_handled();
    }
}

/// Feeds transport push events into the registry
struct InboundPump {
    registry: Arc<CallRegistry>,
    context: Arc<CallContext>,
    availability: Arc<watch::Sender<Availability>>,
    token: CancellationToken,
}

impl InboundPump {
    async fn run(self, connection: TransportConnection) {
        let TransportConnection { id, mut events } = connection;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::IncomingCall(record)) => {
                    info!(call_id = %record.id, from = %record.number, "Incoming call");
                    self.registry.observe(&record);
                }
                Some(TransportEvent::CallUpdated(record)) => {
                    self.registry.observe(&record);
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    warn!(connection_id = %id, reason = %reason, "Signaling connection lost");
                    publish(&self.availability, Availability::Degraded { reason: reason.clone() });
                    self.context
                        .observers
                        .dispatch(&SessionEvent::Error(SessionError::connection(reason)));
                }
                None => {
                    debug!(connection_id = %id, "Status channel closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallStatus;
    use crate::recovery::RetryConfig;
    use crate::transport::loopback::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;

    fn fast_settings() -> ManagerSettings {
        ManagerSettings::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_eviction_grace(Duration::from_millis(20))
            .with_call_lookup(20, Duration::from_millis(10))
            .with_register_timeout(Duration::from_millis(200))
            .with_connect_retry(RetryConfig::fixed(2, Duration::from_millis(5)))
            .with_dial_retry(RetryConfig::fixed(2, Duration::from_millis(5)))
            .with_reconnect_retry(RetryConfig::fixed(2, Duration::from_millis(10)))
    }

    fn manager() -> (Arc<SessionManager>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        (SessionManager::new(transport.clone(), fast_settings()), transport)
    }

    fn config() -> SessionConfig {
        SessionConfig::new("agent", "secret").with_header("x-queue", "sales")
    }

    #[tokio::test]
    async fn initialize_registers_with_custom_headers() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();

        assert_eq!(manager.state(), SessionState::Ready);
        assert!(manager.availability().borrow().is_available());
        assert!(transport.is_registered());
        let headers = transport.register_headers().unwrap();
        assert_eq!(headers.get("x-queue").map(|v| v.to_string()), Some("sales".to_string()));
        assert!(manager.stats().connection_id.is_some());
    }

    #[tokio::test]
    async fn invalid_configuration_never_reaches_transport() {
        let (manager, transport) = manager();
        let err = manager.initialize(SessionConfig::new("", "secret")).await.unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(transport.connect_count(), 0);
        assert_eq!(manager.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn failed_registration_is_a_connection_error() {
        let (manager, transport) = manager();
        transport.fail_next_registers(10);

        let err = manager.initialize(config()).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection { .. }));
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert_eq!(transport.open_connections(), 0);
        assert_eq!(*manager.availability().borrow(), Availability::Offline);
    }

    #[tokio::test]
    async fn transient_registration_failure_is_retried() {
        let (manager, transport) = manager();
        transport.fail_next_registers(1);

        manager.initialize(config()).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.open_connections(), 1);
    }

    #[tokio::test]
    async fn second_initialize_replaces_connection() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();
        let first = manager.stats().connection_id;
        manager.initialize(config()).await.unwrap();

        assert_eq!(transport.open_connections(), 1);
        assert_eq!(transport.peak_connections(), 1);
        assert_eq!(transport.logout_count(), 1);
        assert_ne!(manager.stats().connection_id, first);
    }

    #[tokio::test]
    async fn make_call_requires_initialization() {
        let (manager, _transport) = manager();
        let err = manager.make_call("+15551234567").await.unwrap_err();
        assert!(matches!(err, SessionError::NotInitialized));
    }

    #[tokio::test]
    async fn make_call_rejects_malformed_destination() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();
        let err = manager.make_call("call me maybe").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput { field: "destination", .. }));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn make_call_normalizes_and_returns_connecting_handle() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();

        let call = manager.make_call("1 (555) 123-4567").await.unwrap();
        assert_eq!(call.number(), "+15551234567");
        assert_eq!(call.status(), CallStatus::Connecting);
        assert_eq!(manager.monitor().tracked(), Some(call.id().clone()));
        assert!(transport.dial_headers().unwrap().contains_key("x-queue"));
    }

    #[tokio::test]
    async fn logout_is_idempotent_and_evicts_calls() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();
        let call = manager.make_call("+15551234567").await.unwrap();

        manager.logout().await.unwrap();
        manager.logout().await.unwrap();

        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert!(!manager.monitor().is_running());
        assert!(call.is_evicted());
        assert!(manager.registry().is_empty());
        assert_eq!(transport.logout_count(), 1);
        assert!(matches!(call.mute(true).await, Err(SessionError::CallNotFound { .. })));
    }

    #[tokio::test]
    async fn initialize_after_logout_succeeds() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();
        manager.logout().await.unwrap();
        manager.initialize(config()).await.unwrap();
        assert_eq!(transport.open_connections(), 1);
        assert!(manager.is_initialized());
    }

    #[tokio::test]
    async fn shutdown_notifies_on_complete_once() {
        let (manager, _transport) = manager();
        manager.initialize(config()).await.unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        manager.subscribe(
            |_| {},
            |_| {},
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(manager.initialize(config()).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_push_degrades_availability() {
        let (manager, transport) = manager();
        manager.initialize(config()).await.unwrap();
        let mut availability = manager.availability();

        transport.drop_connection("network unreachable");
        tokio::time::timeout(Duration::from_secs(1), availability.wait_for(|a| !a.is_available()))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(*availability.borrow(), Availability::Degraded { .. }));
    }
}
