//! A state that runs a nested state machine.

use crate::context::Context;
use crate::machine::StateMachine;
use crate::state::{State, StateRef};
use mesrun_core::{BoxError, CancellationToken};

/// Access from an outer context to the context of a nested machine.
pub trait InnerContext<I: Context> {
    fn inner_context(&mut self) -> &mut I;
}

/// Runs a nested state machine to completion as one visit of the outer
/// machine.
///
/// When the nested run is stopped early, the outer machine switches to its
/// end state right away.
pub struct StateMachineState<C: Context, I: Context> {
    name: String,
    machine: StateMachine<I>,
    next_state: StateRef<C>,
    exception_state: Option<StateRef<C>>,
    max_time_state: Option<StateRef<C>>,
}

impl<C, I> StateMachineState<C, I>
where
    C: Context + InnerContext<I>,
    I: Context,
{
    pub fn new(name: impl Into<String>, machine: StateMachine<I>, next_state: StateRef<C>) -> Self {
        Self {
            name: name.into(),
            machine,
            next_state,
            exception_state: None,
            max_time_state: None,
        }
    }

    pub fn with_exception_state(mut self, state: StateRef<C>) -> Self {
        self.exception_state = Some(state);
        self
    }

    pub fn with_max_time_state(mut self, state: StateRef<C>) -> Self {
        self.max_time_state = Some(state);
        self
    }
}

impl<C, I> State<C> for StateMachineState<C, I>
where
    C: Context + InnerContext<I>,
    I: Context,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn exception_state(&self) -> Option<StateRef<C>> {
        self.exception_state.clone()
    }

    fn handle(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), BoxError> {
        let completed = self.machine.run(ctx.inner_context(), cancel)?;
        if !completed {
            tracing::debug!("{}: nested machine {} stopped, end", self.name, self.machine.name());
            ctx.switch_to_end_state();
            return Ok(());
        }

        match &self.max_time_state {
            Some(max_time_state) if ctx.is_max_time_reached() => {
                ctx.switch_to(max_time_state.clone())
            }
            _ => ctx.switch_to(self.next_state.clone()),
        }
        Ok(())
    }
}
