//! # mesrun-statemachine
//!
//! Generic state machine runner for mesrun.
//!
//! This crate provides:
//! - Context and state contracts
//! - State primitives (end, condition, max-time check, frequency, action)
//! - Composite states (multi-state sequences, nested state machines)
//! - The runner with per-state exception routing
//! - The advanced runner driven by a pluggable definition

pub mod context;
pub mod error;
pub mod machine;
pub mod multi;
pub mod nested;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Context, RunState};
pub use error::StateMachineError;
pub use machine::{
    AdvancedStateMachine, BasicDefinition, ExceptionDecision, RunOutcome, StateMachine,
    StateMachineDefinition,
};
pub use multi::MultiState;
pub use nested::{InnerContext, StateMachineState};
pub use state::{
    ActionState, CheckMaxTimeState, ConditionState, EndState, FrequencyState, State, StateRef,
};
