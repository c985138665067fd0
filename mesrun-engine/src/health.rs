//! Liveness checks.
//!
//! The [`ThreadChecker`] runs a periodic background task that verifies
//! every watched worker keeps making progress, that none of them asked
//! for an exit, and that every additional checker passes. Any failure
//! sets the checker's own exit request, observed by the engine.

use crate::exit::ExitFlag;
use dashmap::DashMap;
use mesrun_core::CancellationToken;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Something whose progress is monitored.
pub trait Watched: Send + Sync {
    fn name(&self) -> &str;

    /// Last time progress was recorded.
    fn last_activity(&self) -> Instant;

    fn is_running(&self) -> bool;

    fn exit_requested(&self) -> bool;

    /// Best-effort interruption of the work in progress.
    fn interrupt(&self);
}

/// An extra condition verified at each check.
pub trait AdditionalChecker: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self) {}

    /// Returns false when the process must exit.
    fn check(&self) -> bool;
}

/// Health/liveness collaborator of the engine.
pub trait HealthChecker: Send + Sync {
    fn add_additional_checkers(&self, checkers: Vec<Arc<dyn AdditionalChecker>>);

    fn initialize_additional_checkers(&self);

    /// Starts the periodic checks, once.
    fn start_if_unstarted(&self, cancel: &CancellationToken);

    fn not_responding_timeout(&self) -> Duration;

    fn set_not_responding_timeout(&self, timeout: Duration);

    fn exit_requested(&self) -> bool;

    /// Stops the periodic checks.
    fn abort(&self);

    /// Adds an item to monitor.
    fn watch(&self, watched: Arc<dyn Watched>);
}

struct CheckerState {
    frequency: Duration,
    not_responding_timeout: Mutex<Duration>,
    watched: DashMap<String, Arc<dyn Watched>>,
    checkers: RwLock<Vec<Arc<dyn AdditionalChecker>>>,
    exit: ExitFlag,
}

impl CheckerState {
    fn check(&self) -> bool {
        let timeout = *self.not_responding_timeout.lock();
        let mut ok = true;

        for entry in self.watched.iter() {
            let watched = entry.value();
            if watched.exit_requested() {
                tracing::error!("{} requested to exit", watched.name());
                ok = false;
            }
            if watched.is_running() {
                let idle = watched.last_activity().elapsed();
                if idle > timeout {
                    tracing::error!(
                        "{} is not responding for {:?} (timeout {:?}), interrupt it",
                        watched.name(),
                        idle,
                        timeout
                    );
                    watched.interrupt();
                    ok = false;
                }
            }
        }

        for checker in self.checkers.read().iter() {
            if !checker.check() {
                tracing::error!("Additional checker {} failed", checker.name());
                ok = false;
            }
        }

        if !ok {
            self.exit.request("health check failed");
        }
        ok
    }
}

/// Built-in [`HealthChecker`].
pub struct ThreadChecker {
    state: Arc<CheckerState>,
    started: AtomicBool,
    task_cancel: Mutex<Option<CancellationToken>>,
}

impl ThreadChecker {
    pub fn new(frequency: Duration, not_responding_timeout: Duration) -> Self {
        Self {
            state: Arc::new(CheckerState {
                frequency,
                not_responding_timeout: Mutex::new(not_responding_timeout),
                watched: DashMap::new(),
                checkers: RwLock::new(Vec::new()),
                exit: ExitFlag::new(),
            }),
            started: AtomicBool::new(false),
            task_cancel: Mutex::new(None),
        }
    }

    /// Runs one check now. Returns false if the check failed.
    pub fn check_once(&self) -> bool {
        self.state.check()
    }

    pub fn watched_count(&self) -> usize {
        self.state.watched.len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl HealthChecker for ThreadChecker {
    fn add_additional_checkers(&self, checkers: Vec<Arc<dyn AdditionalChecker>>) {
        self.state.checkers.write().extend(checkers);
    }

    fn initialize_additional_checkers(&self) {
        for checker in self.state.checkers.read().iter() {
            checker.initialize();
        }
    }

    fn start_if_unstarted(&self, cancel: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let task_cancel = cancel.child_token();
        *self.task_cancel.lock() = Some(task_cancel.clone());
        let state = self.state.clone();

        tracing::info!(
            "Health checker started (frequency={:?}, not_responding_timeout={:?})",
            state.frequency,
            *state.not_responding_timeout.lock()
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(state.frequency) => {}
                }
                state.check();
            }
            tracing::info!("Health checker stopped");
        });
    }

    fn not_responding_timeout(&self) -> Duration {
        *self.state.not_responding_timeout.lock()
    }

    fn set_not_responding_timeout(&self, timeout: Duration) {
        *self.state.not_responding_timeout.lock() = timeout;
    }

    fn exit_requested(&self) -> bool {
        self.state.exit.is_requested()
    }

    fn abort(&self) {
        if let Some(token) = self.task_cancel.lock().take() {
            token.cancel();
        }
    }

    fn watch(&self, watched: Arc<dyn Watched>) {
        self.state
            .watched
            .insert(watched.name().to_string(), watched);
    }
}
