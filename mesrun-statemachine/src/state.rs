//! State contract and state primitives.

use crate::context::Context;
use crate::error::StateMachineError;
use chrono::{DateTime, Utc};
use mesrun_core::{BoxError, CancellationToken};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a state.
///
/// States form a directed graph and may be reached from several
/// predecessors, so they are reference counted.
pub type StateRef<C> = Arc<dyn State<C>>;

/// One step of behavior in a state machine.
///
/// A non-terminal state's [`handle`](State::handle) must call
/// [`Context::switch_to`] exactly once before returning `Ok`. Returning an
/// error is the only other legal outcome.
pub trait State<C: Context>: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Performance sampling name; empty disables sampling.
    fn perf_name(&self) -> &str {
        ""
    }

    fn is_terminal(&self) -> bool {
        false
    }

    /// Successor used when [`handle`](State::handle) fails. Terminal
    /// states are never handled and keep the default `None`.
    fn exception_state(&self) -> Option<StateRef<C>> {
        None
    }

    fn handle(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), BoxError>;
}

/// Terminal state. Reached, never handled, and without exception state.
pub struct EndState<C> {
    name: String,
    _context: PhantomData<fn() -> C>,
}

impl<C> EndState<C> {
    pub fn new() -> Self {
        Self::named("End")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _context: PhantomData,
        }
    }
}

impl<C> Default for EndState<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> State<C> for EndState<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn handle(&self, _ctx: &mut C, _cancel: &CancellationToken) -> Result<(), BoxError> {
        tracing::error!("terminal state {} handled", self.name);
        Err(Box::new(StateMachineError::TerminalStateHandled {
            state: self.name.clone(),
        }))
    }
}

type Predicate<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

/// Branches on a predicate evaluated once per visit.
pub struct ConditionState<C: Context> {
    name: String,
    predicate: Predicate<C>,
    true_state: StateRef<C>,
    false_state: StateRef<C>,
    exception_state: Option<StateRef<C>>,
}

impl<C: Context> ConditionState<C> {
    pub fn new<F>(
        name: impl Into<String>,
        predicate: F,
        true_state: StateRef<C>,
        false_state: StateRef<C>,
    ) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            true_state,
            false_state,
            exception_state: None,
        }
    }

    pub fn with_exception_state(mut self, state: StateRef<C>) -> Self {
        self.exception_state = Some(state);
        self
    }
}

impl<C: Context> State<C> for ConditionState<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn exception_state(&self) -> Option<StateRef<C>> {
        self.exception_state.clone()
    }

    fn handle(&self, ctx: &mut C, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let next = if (self.predicate)(ctx) {
            self.true_state.clone()
        } else {
            self.false_state.clone()
        };
        ctx.switch_to(next);
        Ok(())
    }
}

/// Continues while the run is within its max-time budget, else branches
/// to the elapsed state.
pub struct CheckMaxTimeState<C: Context> {
    inner: ConditionState<C>,
}

impl<C: Context> CheckMaxTimeState<C> {
    pub fn new(
        name: impl Into<String>,
        continue_state: StateRef<C>,
        elapsed_state: StateRef<C>,
    ) -> Self {
        Self {
            inner: ConditionState::new(
                name,
                |ctx: &C| !ctx.is_max_time_reached(),
                continue_state,
                elapsed_state,
            ),
        }
    }

    pub fn with_exception_state(mut self, state: StateRef<C>) -> Self {
        self.inner = self.inner.with_exception_state(state);
        self
    }
}

impl<C: Context> State<C> for CheckMaxTimeState<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn exception_state(&self) -> Option<StateRef<C>> {
        self.inner.exception_state()
    }

    fn handle(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), BoxError> {
        self.inner.handle(ctx, cancel)
    }
}

/// Fires `timed_state` at most once per `frequency`, else `other_state`.
///
/// The last firing time is kept in the state itself, so an instance must
/// not be shared between independent contexts.
pub struct FrequencyState<C: Context> {
    name: String,
    frequency: Duration,
    timed_state: StateRef<C>,
    other_state: StateRef<C>,
    last_invoked: Mutex<Option<DateTime<Utc>>>,
}

impl<C: Context> FrequencyState<C> {
    pub fn new(
        name: impl Into<String>,
        frequency: Duration,
        timed_state: StateRef<C>,
        other_state: StateRef<C>,
    ) -> Self {
        Self {
            name: name.into(),
            frequency,
            timed_state,
            other_state,
            last_invoked: Mutex::new(None),
        }
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn last_invoked(&self) -> Option<DateTime<Utc>> {
        *self.last_invoked.lock()
    }
}

impl<C: Context> State<C> for FrequencyState<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, ctx: &mut C, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let now = ctx.now();
        let fire = {
            let mut last = self.last_invoked.lock();
            let due = match *last {
                None => true,
                Some(last) => (now - last)
                    .to_std()
                    .map(|elapsed| elapsed >= self.frequency)
                    .unwrap_or(false),
            };
            if due {
                *last = Some(now);
            }
            due
        };

        if fire {
            tracing::debug!("{}: frequency {:?} elapsed", self.name, self.frequency);
            ctx.switch_to(self.timed_state.clone());
        } else {
            ctx.switch_to(self.other_state.clone());
        }
        Ok(())
    }
}

type Action<C> = Box<dyn Fn(&mut C, &CancellationToken) -> Result<(), BoxError> + Send + Sync>;

/// Runs an action, then switches to `next_state`, or to `max_time_state`
/// when the budget is exhausted after the action.
pub struct ActionState<C: Context> {
    name: String,
    perf_name: String,
    action: Action<C>,
    next_state: StateRef<C>,
    exception_state: Option<StateRef<C>>,
    max_time_state: Option<StateRef<C>>,
}

impl<C: Context> ActionState<C> {
    pub fn new<F>(name: impl Into<String>, action: F, next_state: StateRef<C>) -> Self
    where
        F: Fn(&mut C, &CancellationToken) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            perf_name: name.clone(),
            name,
            action: Box::new(action),
            next_state,
            exception_state: None,
            max_time_state: None,
        }
    }

    pub fn with_perf_name(mut self, perf_name: impl Into<String>) -> Self {
        self.perf_name = perf_name.into();
        self
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

impl<C: Context> State<C> for ActionState<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn perf_name(&self) -> &str {
        &self.perf_name
    }

    fn exception_state(&self) -> Option<StateRef<C>> {
        self.exception_state.clone()
    }

    fn handle(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), BoxError> {
        (self.action)(ctx, cancel)?;
        match &self.max_time_state {
            Some(max_time_state) if ctx.is_max_time_reached() => {
                ctx.switch_to(max_time_state.clone())
            }
            _ => ctx.switch_to(self.next_state.clone()),
        }
        Ok(())
    }
}
