//! Execution context contract.
//!
//! A context is the mutable data threaded through one state machine run.
//! Its bookkeeping (current state, start timestamp, max-time budget, clock)
//! lives in a [`RunState`] the context exposes through
//! [`Context::run_state`] and [`Context::run_state_mut`].

use crate::state::{EndState, StateRef};
use chrono::{DateTime, Utc};
use mesrun_core::{Clock, SystemClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Run bookkeeping embedded in every context.
pub struct RunState<C: Context> {
    current: StateRef<C>,
    end_state: StateRef<C>,
    start: Option<DateTime<Utc>>,
    max_time: Option<Duration>,
    clock: Arc<dyn Clock>,
    composite_depth: usize,
}

impl<C: Context> RunState<C> {
    /// Creates the bookkeeping with no time budget and the system clock.
    /// The current state is the private end state until a run starts.
    pub fn new() -> Self {
        let end_state: StateRef<C> = Arc::new(EndState::new());
        Self {
            current: end_state.clone(),
            end_state,
            start: None,
            max_time: None,
            clock: Arc::new(SystemClock),
            composite_depth: 0,
        }
    }

    /// Sets the maximum duration of one run.
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current(&self) -> &StateRef<C> {
        &self.current
    }

    pub fn set_current(&mut self, state: StateRef<C>) {
        self.current = state;
    }

    pub fn end_state(&self) -> &StateRef<C> {
        &self.end_state
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub(crate) fn set_start(&mut self, start: Option<DateTime<Utc>>) {
        self.start = start;
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time
    }

    pub fn set_max_time(&mut self, max_time: Option<Duration>) {
        self.max_time = max_time;
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// True while a composite state runs one of its children. The child's
    /// own switch is superseded by the composite's and is not recorded.
    pub fn in_composite(&self) -> bool {
        self.composite_depth > 0
    }

    pub(crate) fn enter_composite(&mut self) {
        self.composite_depth += 1;
    }

    pub(crate) fn leave_composite(&mut self) {
        self.composite_depth = self.composite_depth.saturating_sub(1);
    }

    /// Detaches a nested run from the composite scopes of its caller.
    pub(crate) fn take_composite_depth(&mut self) -> usize {
        std::mem::take(&mut self.composite_depth)
    }

    pub(crate) fn restore_composite_depth(&mut self, depth: usize) {
        self.composite_depth = depth;
    }
}

impl<C: Context> Default for RunState<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> fmt::Debug for RunState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("current", &self.current.name())
            .field("start", &self.start)
            .field("max_time", &self.max_time)
            .finish()
    }
}

/// The mutable data bound to one state machine execution.
///
/// Only the two accessors are required; every other operation has a
/// default built on [`RunState`] and may be overridden.
pub trait Context: Sized + Send + 'static {
    fn run_state(&self) -> &RunState<Self>;

    fn run_state_mut(&mut self) -> &mut RunState<Self>;

    /// Records `state` as the current state.
    ///
    /// Contexts observe transitions through [`Context::on_switch`] rather
    /// than by overriding this method, so that a composite state's child
    /// switch is never seen.
    fn switch_to(&mut self, state: StateRef<Self>) {
        if self.run_state().in_composite() {
            tracing::trace!("switch to {} superseded by composite state", state.name());
            return;
        }
        tracing::trace!(
            "switch from {} to {}",
            self.run_state().current().name(),
            state.name()
        );
        self.on_switch(&state);
        self.run_state_mut().set_current(state);
    }

    /// Called once per recorded transition, before the current state
    /// changes.
    fn on_switch(&mut self, _state: &StateRef<Self>) {}

    /// Switches to the private terminal state.
    fn switch_to_end_state(&mut self) {
        let end = self.run_state().end_state().clone();
        self.switch_to(end);
    }

    fn current_state(&self) -> StateRef<Self> {
        self.run_state().current().clone()
    }

    /// Start of the run in progress, `None` outside of a run.
    fn start_date_time(&self) -> Option<DateTime<Utc>> {
        self.run_state().start()
    }

    fn max_time(&self) -> Option<Duration> {
        self.run_state().max_time()
    }

    fn now(&self) -> DateTime<Utc> {
        self.run_state().clock().now()
    }

    /// Time spent since the start of the run, zero outside of a run.
    fn elapsed(&self) -> Duration {
        self.start_date_time()
            .and_then(|start| (self.now() - start).to_std().ok())
            .unwrap_or_default()
    }

    /// Returns true once the elapsed time exceeds the max-time budget.
    ///
    /// Never true without a budget or outside of a run.
    fn is_max_time_reached(&self) -> bool {
        let Some(max_time) = self.max_time() else {
            return false;
        };
        if self.start_date_time().is_none() {
            return false;
        }
        let elapsed = self.elapsed();
        if elapsed > max_time {
            tracing::warn!(
                "max time {:?} reached in state {} (elapsed {:?})",
                max_time,
                self.run_state().current().name(),
                elapsed
            );
            true
        } else {
            false
        }
    }
}
