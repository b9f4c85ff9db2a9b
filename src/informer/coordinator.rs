//! Starts every registered cache and waits for all of them to sync.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::HasSynced;
use crate::error::{Error, Result};

/// Default polling granularity of [`LifecycleCoordinator::wait_for_sync`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polling granularity in fast mode, for tests
pub const FAST_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Shorter intervals are raised to this
pub const MIN_POLL_INTERVAL: Duration = FAST_POLL_INTERVAL;

/// Lifecycle of a set of caches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Starting,
    WaitingForSync,
    Ready,
    Cancelled,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Starting => "starting",
            LifecycleState::WaitingForSync => "waiting-for-sync",
            LifecycleState::Ready => "ready",
            LifecycleState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Deferred task of a registered cache
pub type Launch = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct Registration {
    name: String,
    launch: Launch,
}

struct Inner {
    state: Mutex<LifecycleState>,
    started: AtomicBool,
    pending: Mutex<Vec<Registration>>,
    probes: Mutex<Vec<(String, Arc<dyn HasSynced>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

/// Shared by every informer factory of one client set.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new(CancellationToken::new(), DEFAULT_POLL_INTERVAL)
    }
}

impl LifecycleCoordinator {
    /// `cancel` stops every cache when cancelled; `poll_interval` bounds how
    /// quickly waits notice sync or cancellation.
    pub fn new(cancel: CancellationToken, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LifecycleState::Unstarted),
                started: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                probes: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                cancel,
                poll_interval,
            }),
        }
    }

    /// Aggressive polling, for tests
    pub fn fast() -> Self {
        Self::new(CancellationToken::new(), FAST_POLL_INTERVAL)
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.inner.state)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Names of every registered cache, in registration order
    pub fn registered(&self) -> Vec<String> {
        lock(&self.inner.probes)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Register a cache. Must happen before [`start`](Self::start).
    pub fn register(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HasSynced>,
        launch: Launch,
    ) -> Result<()> {
        let name = name.into();
        // Holding `pending` across the check orders registration against `start`.
        let mut pending = lock(&self.inner.pending);
        if self.is_started() {
            return Err(Error::configuration(format!(
                "cache {name} registered after the informers were started"
            )));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(Error::configuration(format!(
                "cache {name} registered after cancellation"
            )));
        }

        debug!(cache = %name, "Registered cache");
        lock(&self.inner.probes).push((name.clone(), probe));
        pending.push(Registration { name, launch });
        Ok(())
    }

    /// Launch every registered cache. Later calls are no-ops.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let registrations = {
            let mut pending = lock(&self.inner.pending);
            if self.inner.started.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *pending)
        };

        self.set_state(LifecycleState::Starting);
        info!(caches = registrations.len(), "Starting informers");

        let mut tasks = lock(&self.inner.tasks);
        for registration in registrations {
            let token = self.inner.cancel.child_token();
            debug!(cache = %registration.name, "Launching cache");
            tasks.push(tokio::spawn((registration.launch)(token)));
        }
        drop(tasks);

        if self.inner.cancel.is_cancelled() {
            self.set_state(LifecycleState::Cancelled);
        } else {
            self.set_state(LifecycleState::WaitingForSync);
        }
    }

    /// Wait until every registered cache reports synced.
    ///
    /// Returns `false` on timeout, on cancellation, or when called before
    /// [`start`](Self::start).
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        if !self.is_started() {
            warn!("wait_for_sync called before start");
            return false;
        }

        let probes: Vec<Arc<dyn HasSynced>> = lock(&self.inner.probes)
            .iter()
            .map(|(_, probe)| probe.clone())
            .collect();
        let started = Instant::now();
        let synced = wait_for_cache_sync(
            &self.inner.cancel,
            self.inner.poll_interval,
            started + timeout,
            &probes,
        )
        .await;

        if synced {
            self.set_state(LifecycleState::Ready);
            info!(
                caches = probes.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "All caches synced"
            );
        } else if self.inner.cancel.is_cancelled() {
            self.set_state(LifecycleState::Cancelled);
        } else {
            warn!(pending = ?self.unsynced(), ?timeout, "Timed out waiting for caches");
        }
        synced
    }

    /// Start and wait in one call
    pub async fn run_and_wait(&self, timeout: Duration) -> bool {
        self.start();
        self.wait_for_sync(timeout).await
    }

    /// Names of caches not yet synced
    pub fn unsynced(&self) -> Vec<String> {
        lock(&self.inner.probes)
            .iter()
            .filter(|(_, probe)| !probe.has_synced())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stop every cache
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.set_state(LifecycleState::Cancelled);
    }

    /// Cancel and wait for every cache task to finish
    pub async fn shutdown(&self) {
        self.cancel();
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cache task ended abnormally");
            }
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = lock(&self.inner.state);
        if *state != LifecycleState::Cancelled {
            *state = next;
        }
    }
}

/// Poll `probes` every `interval` until all report synced, `deadline` passes
/// or `cancel` fires.
pub async fn wait_for_cache_sync(
    cancel: &CancellationToken,
    interval: Duration,
    deadline: Instant,
    probes: &[Arc<dyn HasSynced>],
) -> bool {
    let interval = interval.max(MIN_POLL_INTERVAL);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        if probes.iter().all(|probe| probe.has_synced()) {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wake = (now + interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
