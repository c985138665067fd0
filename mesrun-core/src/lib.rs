//! # mesrun-core
//!
//! Shared building blocks for mesrun.
//!
//! This crate provides:
//! - Fault types (`Fault`, `AbortError`, `Cancelled`)
//! - The ordered, extensible error classifier registry
//! - Wall clocks (system and manual)
//! - Cancellable sleeps (blocking and async)
//! - Performance sampling contract
//! - Key/default configuration lookup

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod perf;
pub mod sleep;

pub use classify::{log_fault, DefaultClassifier, ErrorClassification, ErrorClassifier, FaultClass};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigSet, ConfigSetExt, ConfigValue, EnvConfigSet, LayeredConfigSet, MemoryConfigSet};
pub use error::{is_cancellation, AbortError, BoxError, Cancelled, Fault, FaultKind};
pub use perf::{NoopPerfRecorder, PerfRecorder, PerfSample};

/// Cooperative cancellation signal threaded through every blocking call.
pub use tokio_util::sync::CancellationToken;
