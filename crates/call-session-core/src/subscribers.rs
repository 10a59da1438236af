//! Ordered subscriber lists with synchronous, snapshot-based dispatch
//!
//! Events are delivered to every live subscriber in registration order on
//! the caller's thread. The list is snapshotted before dispatch, so a
//! callback that unsubscribes itself (or anyone else) mid-delivery neither
//! panics nor causes a remaining subscriber to be skipped.
//!
//! A callback that panics is isolated: the panic is caught and logged and
//! delivery continues. A callback that runs past the configured budget is
//! reported at `warn`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, warn};

pub(crate) type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

struct SubscriberList<E> {
    label: &'static str,
    budget: Duration,
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<E>)>>,
}

impl<E: 'static> Detach for SubscriberList<E> {
    fn detach(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

/// Shared, cloneable list of callbacks for events of type `E`
pub(crate) struct Subscribers<E> {
    inner: Arc<SubscriberList<E>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: 'static> Subscribers<E> {
    pub(crate) fn new(label: &'static str, budget: Duration) -> Self {
        Self {
            inner: Arc::new(SubscriberList {
                label,
                budget,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn subscribe(&self, callback: Callback<E>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push((id, callback));
        let list: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            id,
            list: Arc::downgrade(&list),
        }
    }

    /// Deliver `event` to a snapshot of the current subscribers
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub(crate) fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<(u64, Callback<E>)> = self.inner.entries.lock().clone();
        let mut delivered = 0;
        for (id, callback) in snapshot {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
            let elapsed = started.elapsed();
            if elapsed > self.inner.budget {
                warn!(
                    list = self.inner.label,
                    subscriber = id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.inner.budget.as_millis() as u64,
                    "Subscriber exceeded its callback budget"
                );
            }
            match outcome {
                Ok(()) => delivered += 1,
                Err(_) => error!(list = self.inner.label, subscriber = id, "Subscriber panicked during dispatch"),
            }
        }
        delivered
    }

    pub(crate) fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

/// Handle returned by every `subscribe` call
///
/// Dropping a `Subscription` does **not** unsubscribe; call
/// [`Subscription::unsubscribe`] explicitly. Unsubscribing twice, or after
/// the owning call has been released, is harmless.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    list: Weak<dyn Detach>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// A subscription that was never attached to a list
    pub(crate) fn detached() -> Self {
        let list: Weak<SubscriberList<()>> = Weak::new();
        Self { id: 0, list }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Returns `true` if it was still registered.
    pub fn unsubscribe(&self) -> bool {
        match self.list.upgrade() {
            Some(list) => list.detach(self.id),
            None => false,
        }
    }

    /// Whether the owning list is still alive
    pub fn is_active(&self) -> bool {
        self.list.strong_count() > 0
    }
}
