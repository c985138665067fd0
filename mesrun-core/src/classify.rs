//! Error classification.
//!
//! An [`ErrorClassification`] is an ordered list of [`ErrorClassifier`]s.
//! Each predicate is asked of every classifier in registration order; the
//! first match wins. When no classifier matches, the predicate is asked
//! again on the error's source, recursively, until the chain ends.
//!
//! The registry is an explicit value passed to the state machine runner
//! and to the scheduling engine at construction time.

use crate::error::{chain, AbortError, Fault, FaultKind};
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// A pluggable set of predicates characterizing an error.
///
/// Every predicate only inspects the error it receives: recursion into
/// sources is done by [`ErrorClassification`].
pub trait ErrorClassifier: Send + Sync {
    /// Unrecoverable at the process level.
    fn requires_exit(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// In-memory data is out of date.
    fn is_stale(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// Missing rights.
    fn is_unauthorized(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// Transient failure, the request may be retried.
    fn is_temporary(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// Storage serialization conflict.
    fn is_transaction_serialization_failure(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// Storage transaction aborted.
    fn is_transaction_aborted(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// A request timed out.
    fn is_timeout_failure(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// Transient failure that needs some time before the system is back.
    fn is_temporary_with_delay(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// The unit of work is malformed and must be skipped.
    fn is_invalid(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }

    /// A benign condition reported as an error.
    fn is_not_error(&self, _error: &(dyn Error + 'static)) -> bool {
        false
    }
}

/// Classifier for the crate's own fault types, `std::io::Error` and
/// `tokio::time::error::Elapsed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    fn fault_kind(error: &(dyn Error + 'static)) -> Option<FaultKind> {
        error.downcast_ref::<Fault>().map(|f| f.kind)
    }

    fn io_kind(error: &(dyn Error + 'static)) -> Option<io::ErrorKind> {
        error.downcast_ref::<io::Error>().map(|e| e.kind())
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn requires_exit(&self, error: &(dyn Error + 'static)) -> bool {
        error.is::<AbortError>()
            || Self::fault_kind(error) == Some(FaultKind::OutOfMemory)
            || Self::io_kind(error) == Some(io::ErrorKind::OutOfMemory)
    }

    fn is_stale(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::Stale)
    }

    fn is_unauthorized(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::Unauthorized)
            || Self::io_kind(error) == Some(io::ErrorKind::PermissionDenied)
    }

    fn is_temporary(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::Temporary)
    }

    fn is_transaction_serialization_failure(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::SerializationFailure)
    }

    fn is_transaction_aborted(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::TransactionAborted)
    }

    fn is_timeout_failure(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::Timeout)
            || Self::io_kind(error) == Some(io::ErrorKind::TimedOut)
            || error.is::<tokio::time::error::Elapsed>()
    }

    fn is_temporary_with_delay(&self, error: &(dyn Error + 'static)) -> bool {
        if Self::fault_kind(error) == Some(FaultKind::TemporaryWithDelay) {
            return true;
        }
        matches!(
            Self::io_kind(error),
            Some(
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            )
        )
    }

    fn is_invalid(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::Invalid)
            || matches!(
                Self::io_kind(error),
                Some(io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput)
            )
    }

    fn is_not_error(&self, error: &(dyn Error + 'static)) -> bool {
        Self::fault_kind(error) == Some(FaultKind::NotError)
            || Self::io_kind(error) == Some(io::ErrorKind::NotFound)
    }
}

/// Outcome of [`ErrorClassification::classify`], in decision order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Request a full shutdown and propagate a fatal abort.
    RequiresExit,
    /// Reload and retry without delay.
    Stale,
    /// Storage conflict, retry without delay.
    SerializationFailure,
    /// Storage transaction aborted, retry without delay.
    TransactionAborted,
    /// Sleep the configured delay, then retry.
    TemporaryWithDelay,
    /// Retry without delay.
    Temporary,
    /// Skip the unit of work, keep going.
    Invalid,
    /// Nothing to do.
    NotError,
    /// Log at the highest severity, retry after the normal idle delay.
    Unclassified,
}

impl FaultClass {
    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultClass::RequiresExit => "requires_exit",
            FaultClass::Stale => "stale",
            FaultClass::SerializationFailure => "serialization_failure",
            FaultClass::TransactionAborted => "transaction_aborted",
            FaultClass::TemporaryWithDelay => "temporary_with_delay",
            FaultClass::Temporary => "temporary",
            FaultClass::Invalid => "invalid",
            FaultClass::NotError => "not_error",
            FaultClass::Unclassified => "unclassified",
        }
    }

    /// Whether the failed unit of work may simply be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FaultClass::Stale
                | FaultClass::SerializationFailure
                | FaultClass::TransactionAborted
                | FaultClass::TemporaryWithDelay
                | FaultClass::Temporary
        )
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logs a classified fault at the severity of its class.
pub fn log_fault(class: FaultClass, origin: &str, error: &(dyn Error + 'static)) {
    let inner = error.source().map(|e| e.to_string()).unwrap_or_default();
    match class {
        FaultClass::Stale | FaultClass::SerializationFailure | FaultClass::TransactionAborted => {
            tracing::info!("{}: {} ({}) inner='{}' => try again", origin, error, class, inner)
        }
        FaultClass::Temporary | FaultClass::TemporaryWithDelay => {
            tracing::warn!("{}: {} ({}) inner='{}' => try again", origin, error, class, inner)
        }
        FaultClass::Invalid => {
            tracing::error!("{}: invalid request {} inner='{}' => skip it and continue", origin, error, inner)
        }
        FaultClass::NotError => tracing::debug!("{}: {} is not an error", origin, error),
        FaultClass::RequiresExit => {
            tracing::error!("{}: {} inner='{}' requires to exit, give up", origin, error, inner)
        }
        FaultClass::Unclassified => {
            tracing::error!("{}: unexpected error {} inner='{}'", origin, error, inner)
        }
    }
}

/// Ordered registry of classifiers.
#[derive(Clone)]
pub struct ErrorClassification {
    classifiers: Vec<Arc<dyn ErrorClassifier>>,
}

impl Default for ErrorClassification {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassification")
            .field("classifiers", &self.classifiers.len())
            .finish()
    }
}

impl ErrorClassification {
    /// Creates a registry containing only the [`DefaultClassifier`].
    pub fn new() -> Self {
        Self {
            classifiers: vec![Arc::new(DefaultClassifier)],
        }
    }

    /// Creates a registry without any classifier.
    pub fn empty() -> Self {
        Self {
            classifiers: Vec::new(),
        }
    }

    /// Appends a classifier, consulted after the already registered ones.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    /// Number of registered classifiers.
    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    /// First match wins, else recurse into the source.
    fn test<F>(&self, error: &(dyn Error + 'static), predicate: &str, f: F) -> bool
    where
        F: Fn(&dyn ErrorClassifier, &(dyn Error + 'static)) -> bool,
    {
        for (depth, e) in chain(error).enumerate() {
            if depth > 0 {
                tracing::trace!("{}: inspect inner error {}", predicate, e);
            }
            if self.classifiers.iter().any(|c| f(c.as_ref(), e)) {
                return true;
            }
        }
        false
    }

    pub fn requires_exit(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "requires_exit", |c, e| c.requires_exit(e))
    }

    pub fn is_stale(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_stale", |c, e| c.is_stale(e))
    }

    pub fn is_unauthorized(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_unauthorized", |c, e| c.is_unauthorized(e))
    }

    pub fn is_transaction_serialization_failure(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_transaction_serialization_failure", |c, e| {
            c.is_transaction_serialization_failure(e)
        })
    }

    pub fn is_transaction_aborted(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_transaction_aborted", |c, e| c.is_transaction_aborted(e))
    }

    pub fn is_timeout_failure(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_timeout_failure", |c, e| c.is_timeout_failure(e))
    }

    pub fn is_temporary_with_delay(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_temporary_with_delay", |c, e| c.is_temporary_with_delay(e))
    }

    /// Umbrella: temporary, serialization failure, aborted transaction,
    /// timeout or temporary with delay.
    pub fn is_temporary(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_temporary", |c, e| {
            c.is_temporary(e)
                || c.is_transaction_serialization_failure(e)
                || c.is_transaction_aborted(e)
                || c.is_timeout_failure(e)
                || c.is_temporary_with_delay(e)
        })
    }

    pub fn is_invalid(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_invalid", |c, e| c.is_invalid(e))
    }

    pub fn is_not_error(&self, error: &(dyn Error + 'static)) -> bool {
        self.test(error, "is_not_error", |c, e| c.is_not_error(e))
    }

    /// Classifies an error into the single class driving retry decisions.
    ///
    /// `RequiresExit` is checked first so that an exit-requiring cause is
    /// never downgraded to a retry.
    pub fn classify(&self, error: &(dyn Error + 'static)) -> FaultClass {
        if self.requires_exit(error) {
            FaultClass::RequiresExit
        } else if self.is_stale(error) {
            FaultClass::Stale
        } else if self.is_transaction_serialization_failure(error) {
            FaultClass::SerializationFailure
        } else if self.is_transaction_aborted(error) {
            FaultClass::TransactionAborted
        } else if self.is_temporary_with_delay(error) {
            FaultClass::TemporaryWithDelay
        } else if self.is_temporary(error) {
            FaultClass::Temporary
        } else if self.is_invalid(error) {
            FaultClass::Invalid
        } else if self.is_not_error(error) {
            FaultClass::NotError
        } else {
            FaultClass::Unclassified
        }
    }
}
