//! Single-flight refresh coordinator
//!
//! The coordinator owns the process-wide refresh state:
//!
//! - `Idle`: no refresh in flight. The first request to observe `Idle` after a
//!   401 becomes the leader, flips the state to `Refreshing` and runs the
//!   executor exactly once.
//! - `Refreshing { queue }`: every other 401 parks a one-shot sender in the
//!   FIFO queue and waits for the leader's outcome.
//!
//! The check-and-set from `Idle` to `Refreshing` happens under one mutex
//! acquisition, so concurrent tasks on a multi-threaded runtime can never
//! start two refreshes. The lock is never held across an `.await`.
//!
//! Settling drains the whole queue in one pass and returns the state to
//! `Idle`. If the leader is dropped before it settles, its `CycleGuard`
//! settles the cycle as abandoned so no queued request waits forever.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use reqwest::header::HeaderValue;
use session_auth::{CredentialStore, clear_pair, persist_pair};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::RefreshError;
use crate::executor::{RefreshExecutor, UnauthorizedNotifier};

/// Outcome delivered to every request that took part in a refresh cycle.
pub type RefreshOutcome = Result<Secret<String>, RefreshError>;

/// Default bound on a single executor call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

type PendingRequest = oneshot::Sender<RefreshOutcome>;

enum RefreshState {
    Idle,
    Refreshing { queue: Vec<PendingRequest> },
}

/// Role a request takes when it enters a refresh cycle.
enum Role {
    Leader,
    Follower(oneshot::Receiver<RefreshOutcome>),
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    store: Arc<dyn CredentialStore>,
    executor: Option<Arc<dyn RefreshExecutor>>,
    notifier: Option<Arc<dyn UnauthorizedNotifier>>,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        executor: Option<Arc<dyn RefreshExecutor>>,
        notifier: Option<Arc<dyn UnauthorizedNotifier>>,
        timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            store,
            executor,
            notifier,
            timeout,
        }
    }

    /// Obtain a fresh access credential after a 401.
    ///
    /// Starts a refresh cycle if none is running, otherwise waits for the
    /// running one. Every caller of the same cycle receives the same outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        match self.enter() {
            Role::Leader => self.lead().await,
            Role::Follower(receiver) => {
                crate::metrics::record_queued();
                debug!("refresh in flight, queued behind it");
                receiver.await.unwrap_or(Err(RefreshError::Abandoned))
            }
        }
    }

    /// Tell the host the session is unrecoverable.
    pub fn notify_unauthorized(&self) {
        crate::metrics::record_unauthorized();
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    /// Whether a refresh cycle is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Number of requests queued behind the in-flight refresh.
    pub fn queued(&self) -> usize {
        match &*self.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    fn enter(&self) -> Role {
        let mut state = self.lock_state();
        match &mut *state {
            RefreshState::Idle => {
                *state = RefreshState::Refreshing { queue: Vec::new() };
                Role::Leader
            }
            RefreshState::Refreshing { queue } => {
                let (sender, receiver) = oneshot::channel();
                queue.push(sender);
                Role::Follower(receiver)
            }
        }
    }

    async fn lead(&self) -> RefreshOutcome {
        let guard = CycleGuard {
            coordinator: self,
            settled: false,
        };
        info!("authorization failed, refreshing session credentials");

        let outcome = self.run_executor().await;

        if outcome.is_err()
            && let Err(e) = clear_pair(self.store.as_ref()).await
        {
            warn!(error = %e, "failed to clear credentials after refresh failure");
        }

        let released = guard.settle(&outcome);
        match &outcome {
            Ok(_) => {
                crate::metrics::record_refresh("success");
                info!(released, "session refresh succeeded");
            }
            Err(e) => {
                crate::metrics::record_refresh("failure");
                warn!(error = %e, released, "session refresh failed, signing out");
                self.notify_unauthorized();
            }
        }
        outcome
    }

    async fn run_executor(&self) -> RefreshOutcome {
        let executor = self.executor.as_ref().ok_or(RefreshError::NotConfigured)?;

        let pair = tokio::time::timeout(self.timeout, executor.refresh())
            .await
            .map_err(|_| RefreshError::Timeout(self.timeout))??;

        // The access credential must fit in an Authorization header.
        if pair.access.is_blank() || HeaderValue::from_str(pair.access.expose()).is_err() {
            return Err(RefreshError::MissingCredential);
        }

        persist_pair(self.store.as_ref(), &pair).await?;
        Ok(pair.access)
    }

    /// Resolve or reject every queued request in FIFO order and go idle.
    ///
    /// Returns the number of queued requests released.
    fn settle(&self, outcome: &RefreshOutcome) -> usize {
        let queue = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { queue } => queue,
                RefreshState::Idle => Vec::new(),
            }
        };
        let released = queue.len();
        for pending in queue {
            // A closed receiver means the waiting caller was dropped.
            let _ = pending.send(outcome.clone());
        }
        released
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the cycle as abandoned if the leader is dropped mid-refresh.
struct CycleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl CycleGuard<'_> {
    fn settle(mut self, outcome: &RefreshOutcome) -> usize {
        self.settled = true;
        self.coordinator.settle(outcome)
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let released = self.coordinator.settle(&Err(RefreshError::Abandoned));
            crate::metrics::record_refresh("abandoned");
            warn!(released, "refresh leader dropped before settling");
        }
    }
}
