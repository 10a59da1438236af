//! Supervised background tasks
//!
//! Every background task of a session (the reconciliation loop, the inbound
//! event pump, deferred cleanups, the lifecycle loop) is spawned through a
//! [`Supervisor`]. A supervisor pairs a [`CancellationToken`] with a
//! [`TaskTracker`]: cancelling the token stops every task that honours it,
//! and [`Supervisor::shutdown`] waits until all of them have finished.
//!
//! Child supervisors share the parent's tracker but get a child token, so a
//! single connection can be torn down without touching tasks that belong to
//! the manager as a whole.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Supervisor {
    name: Arc<str>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Child supervisor: cancelled with the parent, waited on by the parent
    pub fn child(&self, name: &str) -> Self {
        Self {
            name: Arc::from(format!("{}/{}", self.name, name)),
            token: self.token.child_token(),
            tracker: self.tracker.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(supervisor = %self.name, "Cancelling supervised tasks");
        }
        self.token.cancel();
    }

    /// Spawn a task that is responsible for observing [`Self::token`] itself
    pub fn spawn<F>(&self, task: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.name.clone();
        self.tracker.spawn(async move {
            future.await;
            debug!(supervisor = %name, task = task, "Supervised task finished");
        })
    }

    /// Number of live tasks across this supervisor and its children
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for tracked tasks to wind down
    ///
    /// Returns `false` if tasks were still running when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel();
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    supervisor = %self.name,
                    remaining = self.tracker.len(),
                    "Supervised tasks did not finish before the shutdown timeout"
                );
                false
            }
        }
    }
}
