//! Call registry: the authoritative set of live call handles
//!
//! Handles are keyed by call id, never by phone number, so concurrent calls
//! to or from the same number stay distinguishable. The same call is often
//! observed twice (once by a push notification and once by a poll), so
//! insertion is idempotent.
//!
//! Removal is two-phase. [`CallRegistry::remove`] drops the id from the
//! addressable set at once and leaves a tombstone so late observations of
//! the id are ignored. The handle's subscriptions are released by a deferred
//! cleanup task on the registry's [`Supervisor`] once the grace window has
//! passed, or as soon as the supervisor is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, trace};

use crate::call::{CallId, CallRecord, CallStatus};
use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::handle::{CallContext, CallHandle};
use crate::supervisor::Supervisor;

/// Outcome of reconciling one remote record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observation {
    /// First sighting; a handle was issued
    Inserted,
    /// Known call moved forward
    Updated,
    /// Known call, same status
    Unchanged,
    /// Record would move the call backward and was dropped
    Stale,
    /// The id was already evicted
    Retired,
}

pub struct CallRegistry {
    calls: DashMap<CallId, CallHandle>,
    retired: DashSet<CallId>,
    context: Arc<CallContext>,
    supervisor: Supervisor,
    grace: Duration,
    inserted: AtomicU64,
}

impl CallRegistry {
    pub(crate) fn new(context: Arc<CallContext>, supervisor: Supervisor, grace: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            retired: DashSet::new(),
            context,
            supervisor,
            grace,
            inserted: AtomicU64::new(0),
        }
    }

    /// Insert a handle for `record` unless its id is already known
    ///
    /// Returns `true` if a new handle was issued. Observers registered with
    /// the session manager are told about every new handle.
    pub fn add(&self, record: &CallRecord) -> bool {
        self.insert(record).is_some()
    }

    fn insert(&self, record: &CallRecord) -> Option<CallHandle> {
        if self.retired.contains(&record.id) {
            trace!(call_id = %record.id, "Ignoring record for evicted call");
            return None;
        }
        let handle = match self.calls.entry(record.id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                let handle = CallHandle::new(record, self.context.clone());
                slot.insert(handle.clone());
                handle
            }
        };

        self.inserted.fetch_add(1, Ordering::Relaxed);
        info!(
            call_id = %record.id,
            direction = ?record.direction,
            status = %record.status,
            "Registered call"
        );
        self.context.observers.dispatch(&SessionEvent::Call(handle.clone()));
        Some(handle)
    }

    /// Reconcile one remote record into the registry
    pub(crate) fn observe(&self, record: &CallRecord) -> Observation {
        if self.retired.contains(&record.id) {
            return Observation::Retired;
        }

        let Some(handle) = self.get(&record.id) else {
            return match self.insert(record) {
                Some(_) => {
                    if record.status.is_terminal() {
                        self.context.call_ended(&record.id);
                    }
                    Observation::Inserted
                }
                // Lost an insert race, or evicted in between
                None if self.retired.contains(&record.id) => Observation::Retired,
                None => self.observe(record),
            };
        };

        match handle.apply_status(record.status) {
            Ok(true) => {
                if record.status.is_terminal() {
                    self.context.call_ended(&record.id);
                }
                Observation::Updated
            }
            Ok(false) => Observation::Unchanged,
            Err(e) => {
                debug!(call_id = %record.id, error = %e, "Dropping stale call record");
                Observation::Stale
            }
        }
    }

    /// Force a known call to `TERMINATED` and signal its end
    pub(crate) fn terminate(&self, call_id: &CallId) -> bool {
        let Some(handle) = self.get(call_id) else {
            return false;
        };
        match handle.apply_status(CallStatus::Terminated) {
            Ok(true) => {
                self.context.call_ended(call_id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(call_id = %call_id, error = %e, "Call already terminated");
                false
            }
        }
    }

    /// Remove a call from the addressable set
    ///
    /// The handle stays usable for reads; controls fail from now on. Its
    /// subscriptions are released after the grace window.
    pub fn remove(&self, call_id: &CallId) -> Option<CallHandle> {
        self.retired.insert(call_id.clone());
        let (_, handle) = self.calls.remove(call_id)?;
        handle.mark_evicted();
        info!(
            call_id = %call_id,
            status = %handle.status(),
            grace_ms = self.grace.as_millis() as u64,
            "Evicted call from registry"
        );

        let token = self.supervisor.token();
        let grace = self.grace;
        let pending = handle.clone();
        self.supervisor.spawn("deferred-cleanup", async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = token.cancelled() => {
                    debug!(call_id = %pending.id(), "Running deferred cleanup early");
                }
            }
            pending.release();
        });
        Some(handle)
    }

    /// Evict and release every call at once
    ///
    /// Used on logout: the connection the calls belonged to is gone.
    pub fn clear(&self) -> usize {
        let handles: Vec<CallHandle> = self.calls.iter().map(|entry| entry.value().clone()).collect();
        self.calls.clear();
        self.retired.clear();
        for handle in &handles {
            handle.mark_evicted();
            handle.release();
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "Cleared call registry");
        }
        handles.len()
    }

    pub fn get(&self, call_id: &CallId) -> Option<CallHandle> {
        self.calls.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn handles(&self) -> Vec<CallHandle> {
        self.calls.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<CallId> {
        self.calls.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handles issued since the registry was created
    pub fn total_inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Poll for a handle with bounded retries
    ///
    /// Dial acknowledgments and the call's appearance in the remote call
    /// list are not atomic, hence the polling.
    pub async fn wait_for(&self, call_id: &CallId, attempts: u32, delay: Duration) -> SessionResult<CallHandle> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(handle) = self.get(call_id) {
                debug!(call_id = %call_id, attempt = attempt, "Call handle available");
                return Ok(handle);
            }
            if self.retired.contains(call_id) {
                break;
            }
            if attempt < attempts {
                trace!(call_id = %call_id, attempt = attempt, "Call not registered yet");
                tokio::time::sleep(delay).await;
            }
        }
        Err(SessionError::CallNotFound { call_id: call_id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallDirection;
    use crate::events::CallUpdate;
    use crate::handle::tests::context;
    use crate::monitor::LifecycleSignal;
    use crate::transport::loopback::LoopbackTransport;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn registry(grace: Duration) -> (CallRegistry, mpsc::UnboundedReceiver<LifecycleSignal>, Supervisor) {
        let (ctx, rx) = context(Arc::new(LoopbackTransport::new()));
        let supervisor = Supervisor::new("registry-test");
        (CallRegistry::new(ctx, supervisor.clone(), grace), rx, supervisor)
    }

    fn record(id: &str, status: CallStatus) -> CallRecord {
        CallRecord::new(id, "+15551234567", CallDirection::Inbound, status)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_announces_once() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(10));
        let announced = Arc::new(Mutex::new(Vec::new()));
        let sink = announced.clone();
        registry.context.observers.subscribe(Arc::new(move |event: &SessionEvent| {
            if let SessionEvent::Call(handle) = event {
                sink.lock().push(handle.id().clone());
            }
        }));

        assert!(registry.add(&record("a", CallStatus::Ringing)));
        assert!(!registry.add(&record("a", CallStatus::Ringing)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_inserted(), 1);
        assert_eq!(*announced.lock(), vec![CallId::from("a")]);
    }

    #[tokio::test]
    async fn same_number_different_ids_are_distinct() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(10));
        registry.add(&record("a", CallStatus::Ringing));
        registry.add(&record("b", CallStatus::Ringing));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn observe_updates_and_rejects_stale_records() {
        let (registry, mut rx, _sup) = registry(Duration::from_millis(10));
        assert_eq!(registry.observe(&record("a", CallStatus::Ringing)), Observation::Inserted);
        assert_eq!(registry.observe(&record("a", CallStatus::Ringing)), Observation::Unchanged);
        assert_eq!(registry.observe(&record("a", CallStatus::Connected)), Observation::Updated);
        assert_eq!(registry.observe(&record("a", CallStatus::Ringing)), Observation::Stale);
        assert_eq!(registry.get(&"a".into()).unwrap().status(), CallStatus::Connected);
        assert!(rx.try_recv().is_err());

        assert_eq!(registry.observe(&record("a", CallStatus::Terminated)), Observation::Updated);
        assert!(matches!(rx.try_recv(), Ok(LifecycleSignal::CallEnded(id)) if id.as_str() == "a"));
    }

    #[tokio::test]
    async fn removed_ids_are_not_readmitted() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(10));
        registry.add(&record("a", CallStatus::Connected));
        let handle = registry.remove(&"a".into()).unwrap();

        assert!(handle.is_evicted());
        assert!(!registry.contains(&"a".into()));
        assert_eq!(registry.observe(&record("a", CallStatus::Terminated)), Observation::Retired);
        assert!(!registry.add(&record("a", CallStatus::Connected)));
        assert!(registry.remove(&"a".into()).is_none());
    }

    #[tokio::test]
    async fn subscriptions_survive_until_grace_elapses() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(50));
        registry.add(&record("a", CallStatus::Connected));
        let handle = registry.get(&"a".into()).unwrap();
        handle.subscribe(|_: &CallUpdate| {});

        registry.remove(&"a".into());
        assert_eq!(handle.subscriber_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.is_released());
        assert_eq!(handle.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn cancelling_supervisor_runs_cleanup_early() {
        let (registry, _rx, supervisor) = registry(Duration::from_secs(3600));
        registry.add(&record("a", CallStatus::Connected));
        let handle = registry.remove(&"a".into()).unwrap();

        assert!(supervisor.shutdown(Duration::from_secs(1)).await);
        assert!(handle.is_released());
    }

    #[tokio::test]
    async fn clear_releases_everything_immediately() {
        let (registry, _rx, _sup) = registry(Duration::from_secs(3600));
        registry.add(&record("a", CallStatus::Connected));
        registry.add(&record("b", CallStatus::Ringing));
        let a = registry.get(&"a".into()).unwrap();

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert!(a.is_evicted());
        assert!(a.is_released());
    }

    #[tokio::test]
    async fn wait_for_gives_up_with_call_not_found() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(10));
        let err = registry
            .wait_for(&"missing".into(), 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CallNotFound { .. }));
    }

    #[tokio::test]
    async fn wait_for_finds_late_arrivals() {
        let (registry, _rx, _sup) = registry(Duration::from_millis(10));
        let registry = Arc::new(registry);
        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.add(&record("late", CallStatus::Connecting));
        });

        let handle = registry
            .wait_for(&"late".into(), 20, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(handle.status(), CallStatus::Connecting);
    }
}
