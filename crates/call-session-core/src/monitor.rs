//! Call monitor: periodic reconciliation against the remote call list
//!
//! The monitor runs as one supervised task per tracked call. On every tick
//! it fetches the transport's call list, reconciles every record into the
//! registry, and checks the tracked call. Once the tracked call reaches
//! `TERMINATING`/`TERMINATED` (or vanishes after having been seen) the
//! monitor terminates it locally and stops. The registry's terminal signal
//! then drives eviction and reconnection in the session manager.
//!
//! ```text
//!   tick ──► get_calls() ──► registry.observe(*) ──► tracked call ended?
//!    ▲                                                   │ no      │ yes
//!    └───────────────────────────────────────────────────┘         ▼
//!                                                       terminate + stop
//! ```
//!
//! Ticks never overlap: the next fetch is only issued after the previous
//! reconciliation completed, and missed ticks are delayed rather than
//! bunched. A response that arrives after the monitor was cancelled is
//! dropped unapplied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::call::{CallId, CallRecord};
use crate::registry::CallRegistry;
use crate::supervisor::Supervisor;
use crate::transport::SignalingTransport;

/// Notifications from calls and the monitor to the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleSignal {
    /// The call reached `TERMINATED`
    CallEnded(CallId),
    /// A hangup failed after monitoring was paused for it
    ResumeMonitoring(CallId),
}

struct ActiveMonitor {
    call_id: CallId,
    token: CancellationToken,
    generation: u64,
}

/// Shared record of which call is being monitored, if any
#[derive(Default)]
pub(crate) struct MonitorSlot {
    active: Mutex<Option<ActiveMonitor>>,
    generation: AtomicU64,
    ticks: AtomicU64,
}

impl MonitorSlot {
    /// Make `call_id` the tracked call, cancelling any previous monitor
    fn install(&self, call_id: CallId, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let prior = self.active.lock().replace(ActiveMonitor {
            call_id,
            token,
            generation,
        });
        if let Some(prior) = prior {
            debug!(call_id = %prior.call_id, "Replacing previous call monitor");
            prior.token.cancel();
        }
        generation
    }

    /// Stop whatever is being monitored. Safe to call when idle.
    pub(crate) fn stop(&self) -> bool {
        match self.active.lock().take() {
            Some(active) => {
                active.token.cancel();
                debug!(call_id = %active.call_id, "Stopped call monitoring");
                true
            }
            None => false,
        }
    }

    /// Stop monitoring only if `call_id` is the tracked call
    pub(crate) fn stop_if(&self, call_id: &CallId) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| &a.call_id) != Some(call_id) {
            return false;
        }
        if let Some(active) = active.take() {
            active.token.cancel();
        }
        true
    }

    fn finish(&self, generation: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.generation) == Some(generation) {
            *active = None;
        }
    }

    fn tracked(&self) -> Option<CallId> {
        self.active.lock().as_ref().map(|a| a.call_id.clone())
    }
}

/// Polling reconciler for the most recently dialed call
pub struct CallMonitor {
    slot: Arc<MonitorSlot>,
    registry: Arc<CallRegistry>,
    transport: Arc<dyn SignalingTransport>,
    interval: Duration,
}

impl CallMonitor {
    pub(crate) fn new(
        slot: Arc<MonitorSlot>,
        registry: Arc<CallRegistry>,
        transport: Arc<dyn SignalingTransport>,
        interval: Duration,
    ) -> Self {
        Self {
            slot,
            registry,
            transport,
            interval,
        }
    }

    /// Start tracking `call_id`, replacing any running monitor
    pub fn start(&self, call_id: CallId, supervisor: &Supervisor) {
        let token = supervisor.token().child_token();
        let generation = self.slot.install(call_id.clone(), token.clone());
        info!(
            call_id = %call_id,
            interval_ms = self.interval.as_millis() as u64,
            "Starting call monitor"
        );

        let task = MonitorTask {
            call_id,
            token,
            generation,
            slot: self.slot.clone(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            interval: self.interval,
        };
        supervisor.spawn("call-monitor", task.run());
    }

    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    pub fn tracked(&self) -> Option<CallId> {
        self.slot.tracked()
    }

    pub fn is_running(&self) -> bool {
        self.slot.active.lock().is_some()
    }

    /// Completed fetches across all monitors of this session
    pub fn tick_count(&self) -> u64 {
        self.slot.ticks.load(Ordering::Relaxed)
    }
}

struct MonitorTask {
    call_id: CallId,
    token: CancellationToken,
    generation: u64,
    slot: Arc<MonitorSlot>,
    registry: Arc<CallRegistry>,
    transport: Arc<dyn SignalingTransport>,
    interval: Duration,
}

impl MonitorTask {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seen = false;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(call_id = %self.call_id, "Discarding in-flight call list");
                    break;
                }
                result = self.transport.get_calls() => result,
            };
            self.slot.ticks.fetch_add(1, Ordering::Relaxed);

            match fetched {
                Ok(calls) => {
                    if !self.reconcile(&calls, &mut seen) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(call_id = %self.call_id, error = %e, "Failed to fetch call list");
                }
            }
        }

        self.slot.finish(self.generation);
        debug!(call_id = %self.call_id, "Call monitor stopped");
    }

    /// Returns `false` once the tracked call is over
    fn reconcile(&self, calls: &[CallRecord], seen: &mut bool) -> bool {
        trace!(call_id = %self.call_id, remote_calls = calls.len(), "Reconciling call list");
        for record in calls {
            self.registry.observe(record);
        }

        match calls.iter().find(|record| record.id == self.call_id) {
            Some(record) => {
                *seen = true;
                if record.status.is_ending() {
                    info!(call_id = %self.call_id, status = %record.status, "Tracked call ended");
                    self.registry.terminate(&self.call_id);
                    return false;
                }
            }
            None if *seen => {
                info!(call_id = %self.call_id, "Tracked call vanished from call list");
                self.registry.terminate(&self.call_id);
                return false;
            }
            None => {
                trace!(call_id = %self.call_id, "Tracked call not listed yet");
            }
        }
        true
    }
}
