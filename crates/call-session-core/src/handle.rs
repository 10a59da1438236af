//! Call handles: the application-facing control surface for one call
//!
//! A [`CallHandle`] is a view over the registry's record for a call plus an
//! imperative control surface. Cloning a handle is cheap and every clone
//! refers to the same call. The registry issues at most one handle per call
//! id per call lifecycle.
//!
//! # Control rules
//!
//! | Operation | Allowed in | Repeated call |
//! |---|---|---|
//! | `mute(bool)` | `CONNECTED` | no-op, no event |
//! | `hold()` / `resume()` | `CONNECTED` | no-op, no event |
//! | `dtmf(tones)` | `CONNECTED` | sends again |
//! | `transfer(..)` | `CONNECTED` | rejected once `TRANSFERRING` |
//! | `hangup()` / `disconnect()` | any state before `TERMINATED` | no-op while `TERMINATING` |
//!
//! Controls on a `TERMINATED` call fail with
//! [`SessionError::InvalidCallState`]. Controls on a handle the registry has
//! already evicted fail with [`SessionError::CallNotFound`].
//!
//! # Events
//!
//! Every status or flag change is pushed synchronously to the handle's
//! subscribers in registration order:
//!
//! ```rust,no_run
//! # use call_session_core::{CallHandle, CallUpdate};
//! # async fn example(call: CallHandle) -> call_session_core::SessionResult<()> {
//! let subscription = call.subscribe(|update: &CallUpdate| {
//!     println!("call update: {:?}", update);
//! });
//! call.hold().await?;
//! call.resume().await?;
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::call::{CallDirection, CallId, CallInfo, CallRecord, CallStatus};
use crate::config::{normalize_dtmf, Headers};
use crate::duration::{category, DurationTracker};
use crate::error::{SessionError, SessionResult};
use crate::events::{CallUpdate, SessionEvent};
use crate::monitor::{LifecycleSignal, MonitorSlot};
use crate::subscribers::{Subscribers, Subscription};
use crate::transport::SignalingTransport;

/// Collaborators shared by every handle of one session manager
pub(crate) struct CallContext {
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) monitor: Arc<MonitorSlot>,
    pub(crate) observers: Subscribers<SessionEvent>,
    pub(crate) callback_budget: Duration,
    signals: mpsc::UnboundedSender<LifecycleSignal>,
    /// Signals sent but not yet fully handled by the lifecycle loop
    pending: AtomicUsize,
    settled: Notify,
}

impl CallContext {
    pub(crate) fn new(
        transport: Arc<dyn SignalingTransport>,
        signals: mpsc::UnboundedSender<LifecycleSignal>,
        callback_budget: Duration,
    ) -> Self {
        Self {
            transport,
            monitor: Arc::new(MonitorSlot::default()),
            observers: Subscribers::new("session", callback_budget),
            callback_budget,
            signals,
            pending: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    /// Tell the session manager a call reached its terminal state
    pub(crate) fn call_ended(&self, call_id: &CallId) {
        self.signal(LifecycleSignal::CallEnded(call_id.clone()));
    }

    /// Ask the session manager to monitor `call_id` again
    pub(crate) fn resume_monitoring(&self, call_id: &CallId) {
        self.signal(LifecycleSignal::ResumeMonitoring(call_id.clone()));
    }

    fn signal(&self, signal: LifecycleSignal) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.signals.send(signal) {
            debug!(signal = ?e.0, "Lifecycle loop is gone; dropping signal");
            self.signal_handled();
        }
    }

    /// Called by the lifecycle loop once a signal's work is complete
    pub(crate) fn signal_handled(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settled.notify_waiters();
        }
    }

    pub(crate) fn pending_signals(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every queued lifecycle signal (eviction, reconnection)
    /// has been handled
    pub(crate) async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_signals() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Flag {
    Mute,
    Hold,
}

struct LiveCall {
    status: CallStatus,
    muted: bool,
    on_hold: bool,
    durations: DurationTracker,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl LiveCall {
    fn from_record(record: &CallRecord) -> Self {
        let mut live = Self {
            status: CallStatus::None,
            muted: false,
            on_hold: false,
            durations: DurationTracker::new(),
            connected_at: None,
            ended_at: None,
        };
        live.enter(CallStatus::None, record.status);
        live.status = record.status;
        if !record.status.is_ending() {
            live.set_flag(Flag::Mute, record.muted);
            live.set_flag(Flag::Hold, record.on_hold);
        }
        live
    }

    /// Duration bookkeeping for a `prev -> next` step
    fn enter(&mut self, prev: CallStatus, next: CallStatus) {
        if prev == CallStatus::Ringing {
            self.durations.stop(category::RINGING);
        }
        match next {
            CallStatus::Ringing => self.durations.start(category::RINGING),
            CallStatus::Connected => {
                self.durations.start(category::CONNECTED);
                self.connected_at.get_or_insert_with(Utc::now);
            }
            _ => {}
        }
        if next.is_terminal() {
            self.durations.stop_all();
            self.ended_at = Some(Utc::now());
        }
    }

    fn set_flag(&mut self, flag: Flag, value: bool) -> bool {
        let (current, name) = match flag {
            Flag::Mute => (&mut self.muted, category::MUTED),
            Flag::Hold => (&mut self.on_hold, category::HOLD),
        };
        if *current == value {
            return false;
        }
        *current = value;
        if value {
            self.durations.start(name);
        } else {
            self.durations.stop(name);
        }
        true
    }
}

struct CallEntry {
    id: CallId,
    direction: CallDirection,
    number: String,
    created_at: DateTime<Utc>,
    state: Mutex<LiveCall>,
    subscribers: Subscribers<CallUpdate>,
    evicted: AtomicBool,
    released: AtomicBool,
    hanging_up: AtomicBool,
    context: Arc<CallContext>,
}

/// Control handle for one call
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<CallEntry>,
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.inner.state.lock();
        f.debug_struct("CallHandle")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("number", &self.inner.number)
            .field("status", &live.status)
            .field("muted", &live.muted)
            .field("on_hold", &live.on_hold)
            .field("evicted", &self.inner.evicted.load(Ordering::Acquire))
            .finish()
    }
}

impl CallHandle {
    pub(crate) fn new(record: &CallRecord, context: Arc<CallContext>) -> Self {
        let subscribers = Subscribers::new("call", context.callback_budget);
        Self {
            inner: Arc::new(CallEntry {
                id: record.id.clone(),
                direction: record.direction,
                number: record.number.clone(),
                created_at: Utc::now(),
                state: Mutex::new(LiveCall::from_record(record)),
                subscribers,
                evicted: AtomicBool::new(false),
                released: AtomicBool::new(false),
                hanging_up: AtomicBool::new(false),
                context,
            }),
        }
    }

    // ===== READ-ONLY PROJECTION =====

    pub fn id(&self) -> &CallId {
        &self.inner.id
    }

    pub fn number(&self) -> &str {
        &self.inner.number
    }

    pub fn direction(&self) -> CallDirection {
        self.inner.direction
    }

    pub fn status(&self) -> CallStatus {
        self.inner.state.lock().status
    }

    pub fn is_muted(&self) -> bool {
        self.inner.state.lock().muted
    }

    pub fn is_on_hold(&self) -> bool {
        self.inner.state.lock().on_hold
    }

    /// Whether the registry has dropped this call
    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Time spent in `category` so far, running interval included
    pub fn duration(&self, category: &str) -> Duration {
        self.inner.state.lock().durations.current(category)
    }

    pub fn info(&self) -> CallInfo {
        let live = self.inner.state.lock();
        CallInfo {
            call_id: self.inner.id.clone(),
            direction: self.inner.direction,
            number: self.inner.number.clone(),
            status: live.status,
            muted: live.muted,
            on_hold: live.on_hold,
            durations: live.durations.snapshot(),
            created_at: self.inner.created_at,
            connected_at: live.connected_at,
            ended_at: live.ended_at,
        }
    }

    /// Whether two handles refer to the same issued call
    pub fn same_call(&self, other: &CallHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a callback for this call's updates
    ///
    /// Subscribing to a released handle returns an inert subscription.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CallUpdate) + Send + Sync + 'static,
    {
        if self.inner.released.load(Ordering::Acquire) {
            return Subscription::detached();
        }
        self.inner.subscribers.subscribe(Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    // ===== CONTROLS =====

    pub async fn mute(&self, muted: bool) -> SessionResult<()> {
        self.ensure_controllable("mute", true)?;
        if self.is_muted() == muted {
            return Ok(());
        }
        self.inner
            .context
            .transport
            .set_mute(&self.inner.id, muted)
            .await
            .map_err(|e| self.report("mute", e))?;
        self.update_flag(Flag::Mute, muted);
        Ok(())
    }

    pub async fn hold(&self) -> SessionResult<()> {
        self.set_hold(true, "hold").await
    }

    pub async fn resume(&self) -> SessionResult<()> {
        self.set_hold(false, "resume").await
    }

    /// Request termination of this call
    ///
    /// The call only moves to `TERMINATING` once the transport accepted the
    /// request. A failed request leaves the call as it was, with monitoring
    /// resumed, so the hangup can be retried.
    pub async fn hangup(&self) -> SessionResult<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.invalid_state("hangup", status));
        }
        if self.is_evicted() {
            return Err(SessionError::CallNotFound { call_id: self.inner.id.clone() });
        }
        if status == CallStatus::Terminating {
            debug!(call_id = %self.inner.id, "Call is already terminating");
            return Ok(());
        }
        if self.inner.hanging_up.swap(true, Ordering::AcqRel) {
            debug!(call_id = %self.inner.id, "Hangup already in progress");
            return Ok(());
        }

        let context = &self.inner.context;
        let was_monitored = context.monitor.stop_if(&self.inner.id);
        if was_monitored {
            debug!(call_id = %self.inner.id, "Paused call monitoring for hangup");
        }

        if let Err(e) = context.transport.hangup(&self.inner.id).await {
            self.inner.hanging_up.store(false, Ordering::Release);
            if was_monitored {
                context.resume_monitoring(&self.inner.id);
            }
            return Err(self.report("hangup", e));
        }

        match self.apply_status(CallStatus::Terminating) {
            Ok(_) => {}
            // Lost the race against a push-driven termination
            Err(_) if self.status().is_ending() => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Err(e) = self.apply_status(CallStatus::Terminated) {
            debug!(call_id = %self.inner.id, error = %e, "Call was terminated concurrently");
        }
        info!(call_id = %self.inner.id, "Call hung up");
        context.call_ended(&self.inner.id);
        Ok(())
    }

    /// Alias of [`Self::hangup`]
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.hangup().await
    }

    pub async fn dtmf(&self, tones: &str) -> SessionResult<()> {
        self.ensure_controllable("dtmf", true)?;
        let tones = normalize_dtmf(tones)?;
        self.inner
            .context
            .transport
            .send_dtmf(&self.inner.id, &tones)
            .await
            .map_err(|e| self.report("dtmf", e))?;
        debug!(call_id = %self.inner.id, tones = %tones, "Sent DTMF");
        Ok(())
    }

    /// Hand the call over to `recipient`, attaching routing headers
    pub async fn transfer(&self, recipient: &str, headers: Headers) -> SessionResult<()> {
        self.ensure_controllable("transfer", true)?;
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(SessionError::InvalidInput {
                field: "recipient",
                reason: "transfer target must not be empty".to_string(),
            });
        }
        self.inner
            .context
            .transport
            .transfer(&self.inner.id, recipient, &headers)
            .await
            .map_err(|e| self.report("transfer", e))?;

        if let Err(e) = self.apply_status(CallStatus::Transferring) {
            debug!(call_id = %self.inner.id, error = %e, "Call moved on before transfer was recorded");
        }
        info!(call_id = %self.inner.id, recipient = %recipient, "Call transfer requested");
        Ok(())
    }

    // ===== REGISTRY SIDE =====

    /// Move the call to `next`, emitting a status update on change
    ///
    /// Same-status observations are no-ops. Backward steps are rejected and
    /// leave the call untouched.
    pub(crate) fn apply_status(&self, next: CallStatus) -> SessionResult<bool> {
        let prev = {
            let mut live = self.inner.state.lock();
            let prev = live.status;
            if prev == next {
                return Ok(false);
            }
            if !prev.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    call_id: self.inner.id.clone(),
                    from: prev,
                    to: next,
                });
            }
            live.enter(prev, next);
            live.status = next;
            prev
        };
        debug!(call_id = %self.inner.id, from = %prev, to = %next, "Call status changed");
        self.emit(CallUpdate::Status(next));
        Ok(true)
    }

    pub(crate) fn mark_evicted(&self) {
        self.inner.evicted.store(true, Ordering::Release);
    }

    /// Drop every subscription; further subscribes are inert
    pub(crate) fn release(&self) {
        if !self.inner.released.swap(true, Ordering::AcqRel) {
            self.inner.subscribers.clear();
            debug!(call_id = %self.inner.id, "Released call resources");
        }
    }

    /// Whether the handle's subscriptions have been released
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    // ===== INTERNALS =====

    async fn set_hold(&self, on_hold: bool, operation: &'static str) -> SessionResult<()> {
        self.ensure_controllable(operation, true)?;
        if self.is_on_hold() == on_hold {
            return Ok(());
        }
        self.inner
            .context
            .transport
            .set_hold(&self.inner.id, on_hold)
            .await
            .map_err(|e| self.report(operation, e))?;
        self.update_flag(Flag::Hold, on_hold);
        Ok(())
    }

    fn update_flag(&self, flag: Flag, value: bool) {
        let changed = {
            let mut live = self.inner.state.lock();
            // The call may have ended while the transport request was in flight
            !live.status.is_ending() && live.set_flag(flag, value)
        };
        if changed {
            info!(call_id = %self.inner.id, flag = ?flag, value = value, "Call flag changed");
            self.emit(match flag {
                Flag::Mute => CallUpdate::Mute(value),
                Flag::Hold => CallUpdate::Hold(value),
            });
        }
    }

    fn ensure_controllable(&self, operation: &'static str, require_connected: bool) -> SessionResult<CallStatus> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.invalid_state(operation, status));
        }
        if self.is_evicted() {
            return Err(SessionError::CallNotFound { call_id: self.inner.id.clone() });
        }
        if require_connected && status != CallStatus::Connected {
            return Err(self.invalid_state(operation, status));
        }
        Ok(status)
    }

    fn invalid_state(&self, operation: &'static str, status: CallStatus) -> SessionError {
        SessionError::InvalidCallState {
            call_id: self.inner.id.clone(),
            operation,
            status,
        }
    }

    fn report(&self, operation: &'static str, error: SessionError) -> SessionError {
        warn!(call_id = %self.inner.id, operation = operation, error = %error, "Call control failed");
        self.emit(CallUpdate::Error(error.kind()));
        error
    }

    fn emit(&self, update: CallUpdate) {
        self.inner.subscribers.dispatch(&update);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::loopback::LoopbackTransport;
    use crate::SessionConfig;

    pub(crate) fn context(
        transport: Arc<LoopbackTransport>,
    ) -> (Arc<CallContext>, mpsc::UnboundedReceiver<LifecycleSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let context = Arc::new(CallContext::new(transport, signals, Duration::from_millis(50)));
        (context, rx)
    }

    async fn connected_call() -> (CallHandle, Arc<LoopbackTransport>, mpsc::UnboundedReceiver<LifecycleSignal>) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect(&SessionConfig::new("agent", "pw")).await.unwrap();
        let id = transport.dial("+15551234567", &Headers::new()).await.unwrap();
        let (ctx, rx) = context(transport.clone());
        let record = CallRecord::new(id, "+15551234567", CallDirection::Outbound, CallStatus::Connected);
        (CallHandle::new(&record, ctx), transport, rx)
    }

    fn recorder(handle: &CallHandle) -> Arc<Mutex<Vec<CallUpdate>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handle.subscribe(move |update: &CallUpdate| sink.lock().push(*update));
        seen
    }

    #[tokio::test]
    async fn mute_twice_emits_one_event() {
        let (call, transport, _rx) = connected_call().await;
        let seen = recorder(&call);

        call.mute(true).await.unwrap();
        call.mute(true).await.unwrap();

        assert!(call.is_muted());
        assert_eq!(*seen.lock(), vec![CallUpdate::Mute(true)]);
        assert!(transport.call(call.id()).unwrap().muted);
    }

    #[tokio::test]
    async fn hold_and_resume_track_hold_duration() {
        let (call, _transport, _rx) = connected_call().await;
        let seen = recorder(&call);

        call.hold().await.unwrap();
        assert!(call.is_on_hold());
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.resume().await.unwrap();
        call.resume().await.unwrap();

        assert!(!call.is_on_hold());
        assert_eq!(*seen.lock(), vec![CallUpdate::Hold(true), CallUpdate::Hold(false)]);
        assert!(call.duration(category::HOLD) >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn controls_require_connected_state() {
        let transport = Arc::new(LoopbackTransport::new());
        let (ctx, _rx) = context(transport);
        let record = CallRecord::new("c-1", "+15550000000", CallDirection::Outbound, CallStatus::None);
        let call = CallHandle::new(&record, ctx);

        let err = call.hold().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidCallState { operation: "hold", status: CallStatus::None, .. }
        ));
        assert_eq!(call.status(), CallStatus::None);
        assert!(!call.is_on_hold());
        assert!(call.dtmf("1").await.is_err());
        assert!(call.mute(true).await.is_err());
    }

    #[tokio::test]
    async fn hangup_walks_through_terminating_to_terminated() {
        let (call, transport, mut rx) = connected_call().await;
        let seen = recorder(&call);

        call.hangup().await.unwrap();

        assert_eq!(call.status(), CallStatus::Terminated);
        assert_eq!(
            *seen.lock(),
            vec![
                CallUpdate::Status(CallStatus::Terminating),
                CallUpdate::Status(CallStatus::Terminated)
            ]
        );
        assert_eq!(transport.call(call.id()).unwrap().status, CallStatus::Terminated);
        assert!(matches!(rx.try_recv(), Ok(LifecycleSignal::CallEnded(id)) if &id == call.id()));
        assert!(call.info().ended_at.is_some());
    }

    #[tokio::test]
    async fn failed_hangup_leaves_call_connected_and_can_be_retried() {
        let (call, transport, mut rx) = connected_call().await;
        let seen = recorder(&call);
        transport.fail_next_hangups(1);

        let err = call.hangup().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport { .. }));
        assert_eq!(call.status(), CallStatus::Connected);
        assert_eq!(transport.call(call.id()).unwrap().status, CallStatus::Connected);
        assert!(rx.try_recv().is_err());

        call.hangup().await.unwrap();
        assert_eq!(call.status(), CallStatus::Terminated);
        assert_eq!(transport.call(call.id()).unwrap().status, CallStatus::Terminated);
        assert!(matches!(rx.try_recv(), Ok(LifecycleSignal::CallEnded(id)) if &id == call.id()));
        assert_eq!(
            *seen.lock(),
            vec![
                CallUpdate::Error(ErrorKind::Transport),
                CallUpdate::Status(CallStatus::Terminating),
                CallUpdate::Status(CallStatus::Terminated)
            ]
        );
    }

    #[tokio::test]
    async fn controls_after_termination_are_rejected() {
        let (call, _transport, _rx) = connected_call().await;
        call.disconnect().await.unwrap();

        assert!(matches!(call.hold().await, Err(SessionError::InvalidCallState { .. })));
        assert!(matches!(call.hangup().await, Err(SessionError::InvalidCallState { .. })));
        assert_eq!(call.status(), CallStatus::Terminated);
    }

    #[tokio::test]
    async fn evicted_live_handle_fails_with_not_found() {
        let (call, _transport, _rx) = connected_call().await;
        call.mark_evicted();
        assert!(matches!(call.mute(true).await, Err(SessionError::CallNotFound { .. })));
        assert!(matches!(call.hangup().await, Err(SessionError::CallNotFound { .. })));
    }

    #[tokio::test]
    async fn backward_transition_is_rejected() {
        let (call, _transport, _rx) = connected_call().await;
        let err = call.apply_status(CallStatus::Ringing).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        assert_eq!(call.status(), CallStatus::Connected);
        assert_eq!(call.apply_status(CallStatus::Connected).unwrap(), false);
    }

    #[tokio::test]
    async fn transport_failure_emits_error_update() {
        let (call, transport, _rx) = connected_call().await;
        let seen = recorder(&call);
        transport.remove_call(call.id());

        assert!(call.dtmf("5").await.is_err());
        assert_eq!(
            *seen.lock(),
            vec![CallUpdate::Error(crate::error::ErrorKind::Transport)]
        );
    }

    #[tokio::test]
    async fn dtmf_and_transfer_reach_the_transport() {
        let (call, transport, _rx) = connected_call().await;
        call.dtmf("12#").await.unwrap();
        call.transfer("+15559876543", Headers::new()).await.unwrap();

        assert_eq!(transport.dtmf_sent(), vec![(call.id().clone(), "12#".to_string())]);
        assert_eq!(transport.transfers().len(), 1);
        assert_eq!(call.status(), CallStatus::Transferring);
        assert!(call.transfer("+15559876543", Headers::new()).await.is_err());
    }

    #[tokio::test]
    async fn release_detaches_subscribers() {
        let (call, _transport, _rx) = connected_call().await;
        let _seen = recorder(&call);
        assert_eq!(call.subscriber_count(), 1);

        call.release();
        assert!(call.is_released());
        assert_eq!(call.subscriber_count(), 0);
        assert!(!call.subscribe(|_: &CallUpdate| {}).is_active());
    }

    #[tokio::test]
    async fn connected_duration_starts_from_record() {
        let (call, _transport, _rx) = connected_call().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(call.duration(category::CONNECTED) >= Duration::from_millis(15));
        assert!(call.info().connected_at.is_some());
    }
}
