//! Fakes shared by the engine tests.

use crate::entity::MonitoredEntity;
use crate::memory::MemoryProbe;
use crate::step::{AnalysisStep, StepProvider};
use mesrun_core::{BoxError, CancellationToken};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// What a scripted step does on its `attempt`-th run (0-based).
pub(crate) type Behavior =
    Arc<dyn Fn(&MonitoredEntity, usize, &CancellationToken) -> Result<(), BoxError> + Send + Sync>;

/// Records step starts/finishes across workers.
#[derive(Default)]
pub(crate) struct Recorder {
    starts: Mutex<Vec<u32>>,
    finishes: Mutex<Vec<u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    fn start(&self, id: u32) {
        self.starts.lock().push(id);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self, id: u32) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finishes.lock().push(id);
    }

    pub(crate) fn starts(&self) -> Vec<u32> {
        self.starts.lock().clone()
    }

    pub(crate) fn finishes(&self) -> Vec<u32> {
        self.finishes.lock().clone()
    }

    pub(crate) fn runs_of(&self, id: u32) -> usize {
        self.starts.lock().iter().filter(|s| **s == id).count()
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ScriptedStep {
    entity: MonitoredEntity,
    attempts: usize,
    behavior: Behavior,
    recorder: Arc<Recorder>,
}

impl AnalysisStep for ScriptedStep {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), BoxError> {
        self.recorder.start(self.entity.id);
        let result = (self.behavior)(&self.entity, self.attempts, cancel);
        self.attempts += 1;
        self.recorder.finish(self.entity.id);
        result
    }
}

/// Gives every entity one scripted step.
pub(crate) struct ScriptedProvider {
    pub(crate) recorder: Arc<Recorder>,
    behavior: Behavior,
    discoveries: AtomicUsize,
}

impl ScriptedProvider {
    pub(crate) fn new<F>(behavior: F) -> Arc<Self>
    where
        F: Fn(&MonitoredEntity, usize, &CancellationToken) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            recorder: Arc::new(Recorder::default()),
            behavior: Arc::new(behavior),
            discoveries: AtomicUsize::new(0),
        })
    }

    pub(crate) fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }
}

impl StepProvider for ScriptedProvider {
    fn steps(&self, entity: &MonitoredEntity) -> Vec<Box<dyn AnalysisStep>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        vec![Box::new(ScriptedStep {
            entity: entity.clone(),
            attempts: 0,
            behavior: self.behavior.clone(),
            recorder: self.recorder.clone(),
        })]
    }
}

/// Memory probe returning settable values.
pub(crate) struct FakeMemory {
    total: AtomicU64,
    used: AtomicU64,
}

impl FakeMemory {
    pub(crate) fn new(total: u64, used: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            used: AtomicU64::new(used),
        })
    }

    pub(crate) fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl MemoryProbe for FakeMemory {
    fn total_physical_memory(&self) -> Result<u64, BoxError> {
        Ok(self.total.load(Ordering::SeqCst))
    }

    fn process_physical_memory(&self) -> Result<u64, BoxError> {
        Ok(self.used.load(Ordering::SeqCst))
    }
}
