//! Engine error types.

use mesrun_core::{BoxError, Cancelled};
use thiserror::Error;

/// Errors of the scheduling engine and its workers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine cancelled")]
    Cancelled(#[from] Cancelled),

    /// Fatal: the engine requested its own shutdown.
    #[error("engine abort: {reason}")]
    Abort {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("process memory {used} bytes exceeds the exit limit of {limit} bytes")]
    OutOfMemory { used: u64, limit: u64 },

    #[error("entity discovery failed")]
    Discovery(#[source] BoxError),

    /// A pass failed; the fault is classified by the outer loop.
    #[error("analysis pass failed")]
    Pass(#[source] BoxError),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

impl EngineError {
    pub fn abort(reason: impl Into<String>) -> Self {
        EngineError::Abort {
            reason: reason.into(),
            source: None,
        }
    }

    /// Returns whether this error stops the engine for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Abort { .. } | EngineError::OutOfMemory { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }
}

/// Worker pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("no tokio runtime available")]
    NoRuntime,
}
