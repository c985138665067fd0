//! Fault types shared by the state machine runner and the scheduling engine.

use std::error::Error;
use std::fmt;
use thiserror::Error;

/// A boxed error that can be sent across threads.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Cooperative cancellation was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Unrecoverable condition: the hosting process must shut down.
#[derive(Debug, Error)]
#[error("abort: {reason}")]
pub struct AbortError {
    pub reason: String,
    #[source]
    pub source: Option<BoxError>,
}

impl AbortError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }
}

/// Kind of a [`Fault`], recognized by the default classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// In-memory data is out of date, reload and retry.
    Stale,
    /// Storage serialization conflict.
    SerializationFailure,
    /// Storage transaction was aborted.
    TransactionAborted,
    /// A request timed out.
    Timeout,
    /// Transient, but the system needs some time to recover.
    TemporaryWithDelay,
    /// Transient, retry right away.
    Temporary,
    /// The unit of work is malformed.
    Invalid,
    /// Missing permissions.
    Unauthorized,
    /// Benign condition reported as an error.
    NotError,
    /// Resource exhaustion.
    OutOfMemory,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Stale => "stale data",
            FaultKind::SerializationFailure => "serialization failure",
            FaultKind::TransactionAborted => "transaction aborted",
            FaultKind::Timeout => "timeout",
            FaultKind::TemporaryWithDelay => "temporary failure (delay required)",
            FaultKind::Temporary => "temporary failure",
            FaultKind::Invalid => "invalid request",
            FaultKind::Unauthorized => "unauthorized",
            FaultKind::NotError => "not an error",
            FaultKind::OutOfMemory => "out of memory",
        };
        f.write_str(s)
    }
}

/// A tagged fault raised by analysis code.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an inner error.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Stale, message)
    }

    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::new(FaultKind::SerializationFailure, message)
    }

    pub fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TransactionAborted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn temporary_with_delay(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TemporaryWithDelay, message)
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Temporary, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Invalid, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Unauthorized, message)
    }

    pub fn not_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotError, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OutOfMemory, message)
    }
}

/// Iterates over an error and all its sources, outermost first.
pub fn chain<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |&e| e.source())
}

/// Returns true if a [`Cancelled`] error appears anywhere in the source chain.
pub fn is_cancellation(error: &(dyn Error + 'static)) -> bool {
    chain(error).any(|e| e.is::<Cancelled>())
}

/// Returns true if an [`AbortError`] appears anywhere in the source chain.
pub fn is_abort(error: &(dyn Error + 'static)) -> bool {
    chain(error).any(|e| e.is::<AbortError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("wrapper")]
    struct Wrapper(#[source] BoxError);

    #[test]
    fn test_fault_display() {
        let fault = Fault::stale("machine 3 modified");
        assert_eq!(fault.to_string(), "stale data: machine 3 modified");
    }

    #[test]
    fn test_cancellation_found_in_chain() {
        let err = Wrapper(Box::new(Wrapper(Box::new(Cancelled))));
        assert!(is_cancellation(&err));
        assert!(!is_abort(&err));
    }

    #[test]
    fn test_abort_found_in_chain() {
        let err = Wrapper(Box::new(AbortError::new("memory limit")));
        assert!(is_abort(&err));
        assert!(!is_cancellation(&err));
    }

    #[test]
    fn test_chain_order() {
        let err = Fault::temporary("outer").with_source(Fault::invalid("inner"));
        let messages: Vec<String> = chain(&err).map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec![
                "temporary failure: outer".to_string(),
                "invalid request: inner".to_string()
            ]
        );
    }
}
