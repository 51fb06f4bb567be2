//! Ownership of in-flight generation, tracked through a control key.
//!
//! The control key holds one of three states. It is never deleted: a
//! finished generation writes [`ControlState::Idle`], so "never requested"
//! and "last generation finished" stay distinguishable. Every write carries
//! the request timeout as TTL, so a leader that dies mid-generation only
//! blocks followers until the marker expires.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use super::store::{CacheStore, StoreResult};

const IN_PROGRESS: &str = "1";
const IDLE: &str = "0";

/// State of a control key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No marker stored (never requested, or expired).
    Absent,
    /// A leader is generating.
    InProgress,
    /// The last generation finished.
    Idle,
}

impl ControlState {
    /// Interprets a raw stored value. Anything other than `"1"` counts as idle.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            None => Self::Absent,
            Some(IN_PROGRESS) => Self::InProgress,
            Some(_) => Self::Idle,
        }
    }

    /// The value written to the store for this state, or `None` for `Absent`.
    pub fn as_stored(self) -> Option<&'static str> {
        match self {
            Self::Absent => None,
            Self::InProgress => Some(IN_PROGRESS),
            Self::Idle => Some(IDLE),
        }
    }
}

/// Result of trying to become the leader for a control key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The marker now reads in-progress on our behalf.
    Acquired,
    /// Another caller set the marker between our check and our claim.
    Contended,
}

/// Reads and writes control keys on behalf of the cache stage.
#[derive(Clone)]
pub struct InFlightCoordinator {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl InFlightCoordinator {
    /// `ttl` is applied to both claim and release writes.
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn state(&self, control_key: &str) -> StoreResult<ControlState> {
        let raw = self.store.get(control_key).await?;
        Ok(ControlState::from_stored(raw.as_deref()))
    }

    /// `true` iff the control key currently reads in-progress.
    ///
    /// A failed read is logged and reported as not in progress, which
    /// degrades to uncoordinated generation rather than failing the request.
    pub async fn is_in_progress(&self, control_key: &str) -> bool {
        match self.state(control_key).await {
            Ok(state) => state == ControlState::InProgress,
            Err(e) => {
                warn!(key = control_key, error = %e, "control key read failed");
                false
            }
        }
    }

    /// Marks generation as in progress.
    ///
    /// Uses [`CacheStore::set_unless`], so against a store with an atomic
    /// implementation at most one caller observes [`Claim::Acquired`]. A store
    /// error is logged and treated as acquired: the caller generates anyway.
    pub async fn claim(&self, control_key: &str) -> Claim {
        match self
            .store
            .set_unless(control_key, IN_PROGRESS, IN_PROGRESS, self.ttl)
            .await
        {
            Ok(true) => {
                debug!(key = control_key, "claimed control key");
                Claim::Acquired
            }
            Ok(false) => {
                debug!(key = control_key, "control key already claimed");
                Claim::Contended
            }
            Err(e) => {
                warn!(key = control_key, error = %e, "control key claim failed");
                Claim::Acquired
            }
        }
    }

    /// Marks generation as in progress without checking the current state.
    pub async fn force_claim(&self, control_key: &str) {
        if let Err(e) = self.store.set(control_key, IN_PROGRESS, self.ttl).await {
            warn!(key = control_key, error = %e, "control key claim failed");
        }
    }

    /// Marks the control key idle with the same TTL used to claim it.
    pub async fn release(&self, control_key: &str) {
        mark_idle(self.store.as_ref(), control_key, self.ttl).await;
    }

    /// Returns a guard that releases `control_key` if it is dropped before
    /// [`ReleaseGuard::release`] runs.
    pub fn guard(&self, control_key: &str) -> ReleaseGuard {
        ReleaseGuard {
            store: Some(Arc::clone(&self.store)),
            key: control_key.to_owned(),
            ttl: self.ttl,
        }
    }
}

async fn mark_idle(store: &dyn CacheStore, control_key: &str, ttl: Duration) {
    match store.set(control_key, IDLE, ttl).await {
        Ok(()) => debug!(key = control_key, "released control key"),
        Err(e) => warn!(key = control_key, error = %e, "control key release failed"),
    }
}

/// Releases a claimed control key on every exit path.
///
/// Call [`release`](Self::release) on normal completion. If the owning future
/// is dropped first (e.g. the request task was aborted), `Drop` spawns the
/// release onto the current tokio runtime.
#[must_use = "dropping the guard immediately releases the control key"]
pub struct ReleaseGuard {
    store: Option<Arc<dyn CacheStore>>,
    key: String,
    ttl: Duration,
}

impl ReleaseGuard {
    pub async fn release(mut self) {
        if let Some(store) = self.store.take() {
            mark_idle(store.as_ref(), &self.key, self.ttl).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let ttl = self.ttl;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "leader dropped mid-generation, releasing in background");
                handle.spawn(async move { mark_idle(store.as_ref(), &key, ttl).await });
            }
            Err(_) => {
                warn!(key = %key, "no runtime to release control key, relying on TTL");
            }
        }
    }
}
