//! The scheduling engine.
//!
//! One poll loop visits the workers in registry order every pass. A ready
//! worker goes through two admission gates (in-flight worker count, then
//! process memory), each bounded by its own maximum wait, before being
//! submitted to the bounded [`WorkerPool`]. Faults escaping a pass are
//! classified by the outer loop, which retries, sleeps, or aborts.

use crate::config::Tunables;
use crate::entity::{EntityFilter, EntityProvider};
use crate::error::EngineError;
use crate::exit::ExitFlag;
use crate::health::{HealthChecker, ThreadChecker, Watched};
use crate::memory::{memory_limit, MemoryProbe, SysinfoMemoryProbe};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::step::StepProvider;
use crate::worker::Worker;
use mesrun_core::sleep::{sleep, sleep_with_exit};
use mesrun_core::{
    is_cancellation, log_fault, CancellationToken, Cancelled, ConfigSet, ErrorClassification,
    FaultClass, MemoryConfigSet, NoopPerfRecorder, PerfRecorder,
};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builds an [`Engine`].
pub struct EngineBuilder {
    entities: Arc<dyn EntityProvider>,
    steps: Arc<dyn StepProvider>,
    config: Arc<dyn ConfigSet>,
    filter: EntityFilter,
    health: Option<Arc<dyn HealthChecker>>,
    memory: Option<Arc<dyn MemoryProbe>>,
    classification: Arc<ErrorClassification>,
    perf: Arc<dyn PerfRecorder>,
    metrics: Option<Arc<Metrics>>,
    exit: ExitFlag,
}

impl EngineBuilder {
    pub fn new(entities: Arc<dyn EntityProvider>, steps: Arc<dyn StepProvider>) -> Self {
        Self {
            entities,
            steps,
            config: Arc::new(MemoryConfigSet::new()),
            filter: EntityFilter::all(),
            health: None,
            memory: None,
            classification: Arc::new(ErrorClassification::new()),
            perf: Arc::new(NoopPerfRecorder),
            metrics: None,
            exit: ExitFlag::new(),
        }
    }

    pub fn config(mut self, config: Arc<dyn ConfigSet>) -> Self {
        self.config = config;
        self
    }

    pub fn filter(mut self, filter: EntityFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Defaults to a [`ThreadChecker`].
    pub fn health_checker(mut self, health: Arc<dyn HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    /// Defaults to a [`SysinfoMemoryProbe`].
    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn classification(mut self, classification: Arc<ErrorClassification>) -> Self {
        self.classification = classification;
        self
    }

    pub fn perf_recorder(mut self, perf: Arc<dyn PerfRecorder>) -> Self {
        self.perf = perf;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shares an existing exit flag with the engine.
    pub fn exit_flag(mut self, exit: ExitFlag) -> Self {
        self.exit = exit;
        self
    }

    /// Discovers the entities once and creates one worker per selected
    /// entity, ordered by id.
    pub fn build(self) -> Result<Engine, EngineError> {
        let tunables = Tunables::load(&*self.config);

        let memory: Arc<dyn MemoryProbe> = match self.memory {
            Some(memory) => memory,
            None => Arc::new(SysinfoMemoryProbe::new().map_err(|e| EngineError::Abort {
                reason: "memory probe unavailable".to_string(),
                source: Some(e),
            })?),
        };
        let health: Arc<dyn HealthChecker> = match self.health {
            Some(health) => health,
            None => Arc::new(ThreadChecker::new(
                tunables.not_responding_frequency,
                tunables.not_responding_timeout,
            )),
        };

        let entities = self
            .entities
            .monitored_entities()
            .map_err(EngineError::Discovery)?;
        let discovered = entities.len();
        let entities = self.filter.select(entities);
        tracing::info!(
            "{} of {} monitored entities selected{}",
            entities.len(),
            discovered,
            if self.filter.is_restricted() { " by filter" } else { "" }
        );

        let workers: Vec<Arc<Worker>> = entities
            .into_iter()
            .map(|entity| {
                let mut worker = Worker::new(
                    entity,
                    self.steps.clone(),
                    self.classification.clone(),
                    self.config.clone(),
                    self.exit.clone(),
                )
                .with_perf_recorder(self.perf.clone());
                if let Some(metrics) = &self.metrics {
                    worker = worker.with_metrics(metrics.clone());
                }
                let worker = Arc::new(worker);
                health.watch(worker.clone());
                worker
            })
            .collect();

        Ok(Engine {
            workers,
            config: self.config,
            health,
            memory,
            classification: self.classification,
            metrics: self.metrics,
            exit: self.exit,
            last_activity: Mutex::new(Instant::now()),
        })
    }
}

/// Gate an admission waits on.
#[derive(Debug, Clone, Copy)]
enum Gate {
    Threads,
    Memory,
}

impl Gate {
    fn as_str(self) -> &'static str {
        match self {
            Gate::Threads => "threads",
            Gate::Memory => "memory",
        }
    }
}

/// Periodic multi-entity scheduler.
pub struct Engine {
    workers: Vec<Arc<Worker>>,
    config: Arc<dyn ConfigSet>,
    health: Arc<dyn HealthChecker>,
    memory: Arc<dyn MemoryProbe>,
    classification: Arc<ErrorClassification>,
    metrics: Option<Arc<Metrics>>,
    exit: ExitFlag,
    last_activity: Mutex<Instant>,
}

impl Engine {
    /// Workers in registry order.
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.is_requested()
    }

    /// Last time the poll loop made progress.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Workers queued or running.
    pub fn running_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_in_flight()).count()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Runs until cancelled or aborted. Never returns `Ok`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Infallible, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(Cancelled));
        }

        let tunables = Tunables::load(&*self.config);
        self.health.initialize_additional_checkers();
        self.health
            .set_not_responding_timeout(tunables.not_responding_timeout);
        self.health.start_if_unstarted(cancel);

        let pool = WorkerPool::current(tunables.max_threads_in_pool)?;
        tracing::info!(
            "Engine started with {} worker(s), pool size {}",
            self.workers.len(),
            pool.size()
        );

        let error = match self.run_loop(&pool, cancel).await {
            Ok(never) => match never {},
            Err(e) => e,
        };

        if error.is_fatal() {
            tracing::error!("Engine aborted: {}", error);
            self.interrupt_all();
        } else {
            tracing::info!("Engine stopped: {}", error);
        }
        pool.close();
        self.health.abort();
        Err(error)
    }

    /// Best-effort interruption of the health checker and every worker.
    fn interrupt_all(&self) {
        self.health.abort();
        for worker in &self.workers {
            worker.interrupt();
        }
    }

    async fn run_loop(
        &self,
        pool: &WorkerPool,
        cancel: &CancellationToken,
    ) -> Result<Infallible, EngineError> {
        loop {
            let error = match self.poll(pool, cancel).await {
                Ok(never) => match never {},
                Err(e) => e,
            };

            if cancel.is_cancelled() || is_cancellation(&error) {
                return Err(EngineError::Cancelled(Cancelled));
            }
            if error.is_fatal() {
                self.exit.request(&error.to_string());
                return Err(error);
            }

            let class = self.classification.classify(&error);
            log_fault(class, "Engine", &error);
            if let Some(metrics) = &self.metrics {
                metrics.record_fault(class);
            }

            let tunables = Tunables::load(&*self.config);
            match class {
                FaultClass::RequiresExit => {
                    let reason = "engine fault requires to exit".to_string();
                    self.exit.request(&reason);
                    return Err(EngineError::Abort {
                        reason,
                        source: Some(error.into()),
                    });
                }
                FaultClass::TemporaryWithDelay => {
                    sleep(tunables.temporary_with_delay_sleep, cancel).await?
                }
                FaultClass::Unclassified => sleep(tunables.sleep_error, cancel).await?,
                FaultClass::Stale
                | FaultClass::SerializationFailure
                | FaultClass::TransactionAborted
                | FaultClass::Temporary
                | FaultClass::Invalid
                | FaultClass::NotError => {}
            }
        }
    }

    /// The poll loop. Only returns on error.
    async fn poll(
        &self,
        pool: &WorkerPool,
        cancel: &CancellationToken,
    ) -> Result<Infallible, EngineError> {
        loop {
            let tunables = Tunables::load(&*self.config);
            self.health
                .set_not_responding_timeout(tunables.not_responding_timeout);
            let pass_start = Instant::now();
            self.touch();

            self.check_exit(&tunables)?;
            for worker in &self.workers {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled(Cancelled));
                }
                self.check_exit(&tunables)?;
                if worker.exit_requested() {
                    let reason = format!("{} requested to exit", worker.tag());
                    self.exit.request(&reason);
                    return Err(EngineError::abort(reason));
                }
                if !worker.can_run() {
                    tracing::trace!("{} is busy, skipped", worker.tag());
                    continue;
                }

                self.wait_free_threads(&tunables, cancel).await?;
                self.wait_free_memory(&tunables, cancel).await?;
                self.dispatch(pool, worker, cancel);
                self.touch();
            }

            if let Some(metrics) = &self.metrics {
                metrics.passes_total.inc();
            }

            let elapsed = pass_start.elapsed();
            if elapsed < tunables.frequency {
                sleep_with_exit(tunables.frequency - elapsed, cancel, || {
                    self.exit.is_requested() || self.health.exit_requested()
                })
                .await?;
            } else {
                tracing::debug!(
                    "Pass took {:?}, longer than the frequency {:?}",
                    elapsed,
                    tunables.frequency
                );
            }

            if self.exit.is_requested() {
                return Err(EngineError::abort("exit requested"));
            }
            if self.health.exit_requested() {
                return Err(self.health_exit());
            }
            for worker in &self.workers {
                if worker.exit_requested() {
                    let reason = format!("{} requested to exit", worker.tag());
                    self.exit.request(&reason);
                    return Err(EngineError::abort(reason));
                }
                if worker.is_running() {
                    tracing::warn!(
                        "{} is still running, last activity {:?} ago",
                        worker.tag(),
                        worker.last_activity().elapsed()
                    );
                }
            }
        }
    }

    fn health_exit(&self) -> EngineError {
        let reason = "health checker requested exit";
        self.exit.request(reason);
        EngineError::abort(reason)
    }

    /// Fails when an exit was requested or the process memory exceeds the
    /// exit ceiling.
    fn check_exit(&self, tunables: &Tunables) -> Result<(), EngineError> {
        if self.exit.is_requested() {
            return Err(EngineError::abort("exit requested"));
        }

        let total = self
            .memory
            .total_physical_memory()
            .map_err(EngineError::Pass)?;
        let limit = memory_limit(total, tunables.memory_percentage_exit);
        let used = self
            .memory
            .process_physical_memory()
            .map_err(EngineError::Pass)?;
        if used > limit {
            self.exit.request(&format!(
                "process memory {} bytes exceeds {}% of {} bytes",
                used, tunables.memory_percentage_exit, total
            ));
            return Err(EngineError::OutOfMemory { used, limit });
        }

        if self.health.exit_requested() {
            return Err(self.health_exit());
        }
        Ok(())
    }

    /// Waits until fewer than `Engine.MaxRunningMachineThreads` workers are
    /// in flight, at most `Machine.MaxWaitThread`.
    async fn wait_free_threads(
        &self,
        tunables: &Tunables,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let ceiling = tunables.max_running_machine_threads;
        self.wait_gate(
            Gate::Threads,
            tunables.max_wait_thread,
            tunables.sleep_max_running_threads,
            cancel,
            || {
                let running = self.running_count();
                Ok((running >= ceiling)
                    .then(|| format!("{} workers running, ceiling {}", running, ceiling)))
            },
        )
        .await
    }

    /// Waits until the process memory is below
    /// `Engine.MemoryPercentageStopNewThreads`, at most
    /// `Machine.MaxWaitFreeMemory`.
    async fn wait_free_memory(
        &self,
        tunables: &Tunables,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let percentage = tunables.memory_percentage_stop_new_threads;
        self.wait_gate(
            Gate::Memory,
            tunables.max_wait_free_memory,
            tunables.sleep_free_memory,
            cancel,
            || {
                let total = self
                    .memory
                    .total_physical_memory()
                    .map_err(EngineError::Pass)?;
                let used = self
                    .memory
                    .process_physical_memory()
                    .map_err(EngineError::Pass)?;
                let limit = memory_limit(total, percentage);
                Ok((used > limit)
                    .then(|| format!("process memory {} bytes, limit {} bytes", used, limit)))
            },
        )
        .await
    }

    /// Polls `busy` until the gate is free or `max_wait` elapses. `busy`
    /// returns why the gate is closed, `None` once it is free.
    async fn wait_gate<F>(
        &self,
        gate: Gate,
        max_wait: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
        busy: F,
    ) -> Result<(), EngineError>
    where
        F: Fn() -> Result<Option<String>, EngineError>,
    {
        let start = Instant::now();
        loop {
            let busy = match busy()? {
                None => return Ok(()),
                Some(reason) => reason,
            };
            let waited = start.elapsed();
            if waited >= max_wait {
                tracing::error!(
                    "Waited {:?} for free {} ({}), admit anyway",
                    waited,
                    gate.as_str(),
                    busy
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .admission_timeouts_total
                        .with_label_values(&[gate.as_str()])
                        .inc();
                }
                return Ok(());
            }
            sleep(poll_interval.min(max_wait - waited), cancel).await?;
            if self.exit.is_requested() {
                return Err(EngineError::abort("exit requested"));
            }
        }
    }

    fn dispatch(&self, pool: &WorkerPool, worker: &Arc<Worker>, cancel: &CancellationToken) {
        if !worker.request() {
            return;
        }
        let job = worker.clone();
        let token = cancel.clone();
        let queued = worker.clone();
        let submitted = pool.spawn_or_else(
            worker.tag(),
            move || {
                if let Err(e) = job.run(&token) {
                    if e.is_cancelled() {
                        tracing::debug!("{} cancelled", job.tag());
                    } else {
                        tracing::error!("{} failed: {}", job.tag(), e);
                    }
                }
            },
            move || {
                queued.reset_requested();
            },
        );
        match submitted {
            Ok(_) => {
                tracing::debug!("{} admitted", worker.tag());
                if let Some(metrics) = &self.metrics {
                    metrics.admissions_total.inc();
                }
            }
            Err(e) => {
                worker.reset_requested();
                tracing::warn!("Failed to submit {}: {}", worker.tag(), e);
            }
        }
    }
}
