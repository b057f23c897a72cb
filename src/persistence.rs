//! Pluggable durability hooks and the update debouncer.
//!
//! The relay does not define a storage format. Deployments implement
//! [`Persistence`] over their own store; the registry runs `bind_state`
//! once when a room is constructed and the room runs `write_state` when
//! its last connection leaves, before the room is released. Both hooks
//! execute outside the room lock on a cloned doc handle.
//!
//! The [`Debouncer`] coalesces bursts of document changes into a single
//! side-effect call (webhook, export, metadata refresh):
//!
//! ```text
//! change ──┐
//! change ──┼── trigger() x N ──► quiet for `wait` ──► callback fires once
//! change ──┘                     (capped at `max_wait` per burst)
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use yrs::Doc;

/// Default quiet period before a debounced callback fires.
pub const DEFAULT_DEBOUNCE_WAIT: Duration = Duration::from_millis(2000);
/// Default hard cap on how long a burst can keep postponing the callback.
pub const DEFAULT_DEBOUNCE_MAX_WAIT: Duration = Duration::from_millis(10_000);

/// Durable storage failed.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// `bind_state` could not hydrate the room.
    Load(String),
    /// `write_state` could not flush the room.
    Write(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(e) => write!(f, "Persistence load failed: {e}"),
            Self::Write(e) => write!(f, "Persistence write failed: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Durability hooks called around a room's lifetime.
///
/// Futures are boxed so the registry can hold the hook set behind
/// `Arc<dyn Persistence>`.
pub trait Persistence: Send + Sync {
    /// Hydrate a freshly constructed doc with persisted state for `name`.
    fn bind_state<'a>(
        &'a self,
        name: &'a str,
        doc: &'a Doc,
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;

    /// Persist the current state of `doc` under `name`.
    ///
    /// A room is only destroyed after this resolves successfully; on
    /// failure the in-memory state survives for a later retry.
    fn write_state<'a>(
        &'a self,
        name: &'a str,
        doc: &'a Doc,
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct DebounceState {
    pending: Option<Callback>,
    deadline: Instant,
    /// First trigger of the current burst; anchors the max_wait cap.
    burst_started: Option<Instant>,
    worker_running: bool,
}

/// Coalesces repeated triggers into one deferred callback invocation.
///
/// Each `trigger` replaces the pending callback and pushes the deadline
/// `wait` into the future, never past `max_wait` after the burst began.
/// Must be used from within a tokio runtime.
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self {
            wait,
            max_wait,
            state: Arc::new(Mutex::new(DebounceState {
                pending: None,
                deadline: Instant::now(),
                burst_started: None,
                worker_running: false,
            })),
        }
    }

    /// Schedule `callback`, replacing any pending one.
    pub fn trigger<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let mut state = lock_state(&self.state);

        let burst_started = *state.burst_started.get_or_insert(now);
        let capped = burst_started + self.max_wait;
        state.deadline = (now + self.wait).min(capped);
        state.pending = Some(Box::new(callback));

        if !state.worker_running {
            state.worker_running = true;
            tokio::spawn(run_worker(self.state.clone()));
        }
    }

    /// Discard the pending callback, if any.
    pub fn cancel(&self) {
        let mut state = lock_state(&self.state);
        state.pending = None;
        state.burst_started = None;
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WAIT, DEFAULT_DEBOUNCE_MAX_WAIT)
    }
}

/// Sleeps toward the moving deadline, fires the pending callback once
/// settled, and exits. Triggers landing mid-sleep move the deadline;
/// cancellation empties `pending` and the worker just winds down.
async fn run_worker(state: Arc<Mutex<DebounceState>>) {
    loop {
        let deadline = lock_state(&state).deadline;
        tokio::time::sleep_until(deadline).await;

        let fired = {
            let mut s = lock_state(&state);
            if s.pending.is_none() {
                s.worker_running = false;
                s.burst_started = None;
                return;
            }
            if Instant::now() >= s.deadline {
                let callback = s.pending.take();
                s.worker_running = false;
                s.burst_started = None;
                callback
            } else {
                None
            }
        };

        if let Some(callback) = fired {
            callback();
            return;
        }
    }
}

fn lock_state(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
