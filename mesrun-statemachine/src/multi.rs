//! Composite state running a fixed sequence of child states.

use crate::context::Context;
use crate::state::{State, StateRef};
use mesrun_core::{BoxError, CancellationToken};
use std::sync::Arc;

/// Runs a fixed sequence of states, one per visit, then continues to
/// `next_state`.
///
/// Each visit delegates to the first remaining child, then switches to a
/// new `MultiState` over the children that are left (or to `next_state`
/// once none are). The children are shared between all the remainders.
/// The child's own switch is superseded, so a visit records exactly one
/// transition.
pub struct MultiState<C: Context> {
    name: String,
    children: Arc<[StateRef<C>]>,
    offset: usize,
    next_state: StateRef<C>,
    next_is_exception_state: bool,
    max_time_state: Option<StateRef<C>>,
}

impl<C: Context> MultiState<C> {
    pub fn new(
        name: impl Into<String>,
        children: Vec<StateRef<C>>,
        next_state: StateRef<C>,
    ) -> Self {
        Self {
            name: name.into(),
            children: children.into(),
            offset: 0,
            next_state,
            next_is_exception_state: false,
            max_time_state: None,
        }
    }

    /// On a child failure, skip to the rest of the sequence unless the
    /// child declares its own exception state.
    pub fn with_next_is_exception_state(mut self, value: bool) -> Self {
        self.next_is_exception_state = value;
        self
    }

    /// Diverts the machine to `state` when the max-time budget is
    /// exhausted after a child.
    pub fn with_max_time_state(mut self, state: StateRef<C>) -> Self {
        self.max_time_state = Some(state);
        self
    }

    /// Children not run yet.
    pub fn remaining(&self) -> &[StateRef<C>] {
        &self.children[self.offset..]
    }

    fn current_child(&self) -> Option<&StateRef<C>> {
        self.children.get(self.offset)
    }

    /// The state following the current child.
    fn remainder(&self) -> StateRef<C> {
        if self.offset + 1 >= self.children.len() {
            return self.next_state.clone();
        }
        Arc::new(Self {
            name: self.name.clone(),
            children: self.children.clone(),
            offset: self.offset + 1,
            next_state: self.next_state.clone(),
            next_is_exception_state: self.next_is_exception_state,
            max_time_state: self.max_time_state.clone(),
        })
    }
}

impl<C: Context> State<C> for MultiState<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn perf_name(&self) -> &str {
        self.current_child().map(|c| c.perf_name()).unwrap_or("")
    }

    fn exception_state(&self) -> Option<StateRef<C>> {
        let child = self.current_child()?;
        if let Some(state) = child.exception_state() {
            return Some(state);
        }
        if self.next_is_exception_state {
            Some(self.remainder())
        } else {
            None
        }
    }

    fn handle(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), BoxError> {
        let Some(child) = self.current_child() else {
            ctx.switch_to(self.next_state.clone());
            return Ok(());
        };

        tracing::debug!(
            "{}: run {} ({}/{})",
            self.name,
            child.name(),
            self.offset + 1,
            self.children.len()
        );
        ctx.run_state_mut().enter_composite();
        let result = child.handle(ctx, cancel);
        ctx.run_state_mut().leave_composite();
        result?;

        if let Some(max_time_state) = &self.max_time_state {
            if ctx.is_max_time_reached() {
                tracing::info!(
                    "{}: max time reached after {}, switch to {}",
                    self.name,
                    child.name(),
                    max_time_state.name()
                );
                ctx.switch_to(max_time_state.clone());
                return Ok(());
            }
        }

        ctx.switch_to(self.remainder());
        Ok(())
    }
}
