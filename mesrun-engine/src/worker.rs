//! Per-entity worker.
//!
//! A worker owns the analysis steps of one entity and a run guard: its
//! status goes Available → Requested (submitted to the pool) → Running →
//! Available. The engine only submits an Available worker, so at most one
//! run of a worker is ever in flight.

use crate::config::keys;
use crate::entity::MonitoredEntity;
use crate::error::EngineError;
use crate::exit::ExitFlag;
use crate::health::Watched;
use crate::metrics::Metrics;
use crate::step::{AnalysisStep, StepProvider};
use mesrun_core::sleep::sleep_blocking;
use mesrun_core::{
    is_cancellation, log_fault, BoxError, CancellationToken, Cancelled, ConfigSet, ConfigSetExt,
    ErrorClassification, FaultClass, NoopPerfRecorder, PerfRecorder, PerfSample,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Run status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Available = 0,
    /// Submitted to the pool, not started yet.
    Requested = 1,
    Running = 2,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Requested,
            2 => WorkerStatus::Running,
            _ => WorkerStatus::Available,
        }
    }
}

/// Resets the status to Available when the run ends, whatever the outcome.
struct RunGuard<'a> {
    worker: &'a Worker,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.worker.run_token.lock() = None;
        self.worker.touch();
        self.worker
            .status
            .store(WorkerStatus::Available as u8, Ordering::SeqCst);
        if let Some(metrics) = &self.worker.metrics {
            metrics.running_workers.dec();
        }
    }
}

pub struct Worker {
    entity: MonitoredEntity,
    tag: String,
    status: AtomicU8,
    exit_requested: AtomicBool,
    engine_exit: ExitFlag,
    last_activity: Mutex<Instant>,
    steps: Mutex<Option<Vec<Box<dyn AnalysisStep>>>>,
    step_provider: Arc<dyn StepProvider>,
    classification: Arc<ErrorClassification>,
    config: Arc<dyn ConfigSet>,
    perf: Arc<dyn PerfRecorder>,
    metrics: Option<Arc<Metrics>>,
    run_token: Mutex<Option<CancellationToken>>,
}

impl Worker {
    pub fn new(
        entity: MonitoredEntity,
        step_provider: Arc<dyn StepProvider>,
        classification: Arc<ErrorClassification>,
        config: Arc<dyn ConfigSet>,
        engine_exit: ExitFlag,
    ) -> Self {
        let tag = format!("Machine {}", entity.id);
        Self {
            entity,
            tag,
            status: AtomicU8::new(WorkerStatus::Available as u8),
            exit_requested: AtomicBool::new(false),
            engine_exit,
            last_activity: Mutex::new(Instant::now()),
            steps: Mutex::new(None),
            step_provider,
            classification,
            config,
            perf: Arc::new(NoopPerfRecorder),
            metrics: None,
            run_token: Mutex::new(None),
        }
    }

    pub fn with_perf_recorder(mut self, perf: Arc<dyn PerfRecorder>) -> Self {
        self.perf = perf;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn entity(&self) -> &MonitoredEntity {
        &self.entity
    }

    /// Pool tag, `Machine <id>`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// True when no run of this worker is queued or in progress.
    pub fn can_run(&self) -> bool {
        self.status() == WorkerStatus::Available
    }

    pub fn is_in_flight(&self) -> bool {
        !self.can_run()
    }

    /// Marks the worker as submitted. Returns false if it was not Available.
    pub fn request(&self) -> bool {
        self.transition(WorkerStatus::Available, WorkerStatus::Requested)
    }

    /// Reverts [`Worker::request`] after a rejected submission.
    pub fn reset_requested(&self) -> bool {
        self.transition(WorkerStatus::Requested, WorkerStatus::Available)
    }

    fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Number of steps bound to the entity, once initialized.
    pub fn step_count(&self) -> Option<usize> {
        self.steps.lock().as_ref().map(Vec::len)
    }

    /// Runs the steps once.
    ///
    /// Stale and temporary faults are logged and left to the next pass; a
    /// temporary-with-delay fault sleeps before returning. A fault that
    /// requires to exit sets the exit requests and is returned as
    /// [`EngineError::Abort`]. Cancellation is always returned. Every other
    /// fault is logged and swallowed.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if !self.transition(WorkerStatus::Requested, WorkerStatus::Running)
            && !self.transition(WorkerStatus::Available, WorkerStatus::Running)
        {
            tracing::warn!("{} is already running", self.tag);
            return Ok(());
        }
        if let Some(metrics) = &self.metrics {
            metrics.running_workers.inc();
        }
        let _guard = RunGuard { worker: self };

        let token = cancel.child_token();
        *self.run_token.lock() = Some(token.clone());
        self.touch();

        let span = tracing::info_span!("worker", entity = self.entity.id, run = %Uuid::new_v4());
        let _enter = span.enter();
        tracing::debug!("{} started", self.tag);

        let result = match self.run_steps(&token) {
            Ok(()) => Ok(()),
            Err(error) => self.handle_fault(error, &token),
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(EngineError::Cancelled(_)) => "cancelled",
            Err(_) => "abort",
        };
        if let Some(metrics) = &self.metrics {
            metrics.worker_runs_total.with_label_values(&[outcome]).inc();
        }
        tracing::debug!("{} finished: {}", self.tag, outcome);
        result
    }

    fn run_steps(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let mut steps = self.steps.lock();
        let steps = steps.get_or_insert_with(|| self.discover_steps());
        let between = self
            .config
            .load_and_get(keys::SLEEP_BETWEEN_PLUGINS, keys::SLEEP_BETWEEN_PLUGINS_DEFAULT);

        for (i, step) in steps.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            if i > 0 && !between.is_zero() {
                sleep_blocking(between, cancel)?;
            }
            self.touch();
            let _sample = PerfSample::start(self.perf.clone(), format!("Analysis.{}", step.name()));
            tracing::trace!("{} runs {}", self.tag, step.name());
            step.run_once(cancel)?;
        }
        Ok(())
    }

    fn discover_steps(&self) -> Vec<Box<dyn AnalysisStep>> {
        let steps: Vec<Box<dyn AnalysisStep>> = self
            .step_provider
            .steps(&self.entity)
            .into_iter()
            .filter_map(|mut step| step.initialize(&self.entity).then_some(step))
            .collect();
        tracing::info!(
            "{} initialized with {} step(s): {}",
            self.tag,
            steps.len(),
            steps.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );
        steps
    }

    fn handle_fault(&self, error: BoxError, cancel: &CancellationToken) -> Result<(), EngineError> {
        if is_cancellation(&*error) {
            tracing::debug!("{} cancelled", self.tag);
            return Err(EngineError::Cancelled(Cancelled));
        }

        let class = self.classification.classify(&*error);
        log_fault(class, &self.tag, &*error);
        if let Some(metrics) = &self.metrics {
            metrics.record_fault(class);
        }

        match class {
            FaultClass::RequiresExit => {
                self.exit_requested.store(true, Ordering::SeqCst);
                let reason = format!("{} requires to exit", self.tag);
                self.engine_exit.request(&reason);
                Err(EngineError::Abort {
                    reason,
                    source: Some(error),
                })
            }
            FaultClass::TemporaryWithDelay => {
                let delay = self.config.load_and_get(
                    keys::TEMPORARY_WITH_DELAY_SLEEP,
                    keys::TEMPORARY_WITH_DELAY_SLEEP_DEFAULT,
                );
                sleep_blocking(delay, cancel)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Watched for Worker {
    fn name(&self) -> &str {
        &self.tag
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn is_running(&self) -> bool {
        self.status() == WorkerStatus::Running
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            tracing::warn!("Interrupting {}", self.tag);
            token.cancel();
        }
    }
}
