//! Performance sampling hook.
//!
//! Consumers that want timings plug a [`PerfRecorder`] in; the default
//! records nothing.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sink for named timing samples.
pub trait PerfRecorder: Send + Sync {
    fn record(&self, key: &str, elapsed: Duration);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPerfRecorder;

impl PerfRecorder for NoopPerfRecorder {
    fn record(&self, _key: &str, _elapsed: Duration) {}
}

/// Records the time elapsed between its creation and its drop.
///
/// An empty key disables recording.
pub struct PerfSample {
    recorder: Arc<dyn PerfRecorder>,
    key: String,
    start: Instant,
}

impl PerfSample {
    pub fn start(recorder: Arc<dyn PerfRecorder>, key: impl Into<String>) -> Self {
        Self {
            recorder,
            key: key.into(),
            start: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PerfSample {
    fn drop(&mut self) {
        if !self.key.is_empty() {
            self.recorder.record(&self.key, self.start.elapsed());
        }
    }
}
