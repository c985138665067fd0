//! State machine error types.

use mesrun_core::{BoxError, Cancelled};
use thiserror::Error;

/// Errors returned by a state machine run.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("state machine run cancelled")]
    Cancelled(#[from] Cancelled),

    #[error("state '{state}' requires to exit")]
    Aborted {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("state '{state}' failed and has no exception state")]
    State {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("exception accepted in state '{state}' but no exception state is defined")]
    MissingExceptionState {
        state: String,
        #[source]
        source: BoxError,
    },

    #[error("terminal state '{state}' must not be handled")]
    TerminalStateHandled { state: String },
}

impl StateMachineError {
    /// Returns whether the run ended because of a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StateMachineError::Cancelled(_))
    }

    /// Returns the name of the state that failed, if any.
    pub fn state(&self) -> Option<&str> {
        match self {
            StateMachineError::Cancelled(_) => None,
            StateMachineError::Aborted { state, .. }
            | StateMachineError::State { state, .. }
            | StateMachineError::MissingExceptionState { state, .. }
            | StateMachineError::TerminalStateHandled { state } => Some(state),
        }
    }
}
