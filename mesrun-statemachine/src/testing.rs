//! Test fixtures shared by the unit tests of this crate.

use crate::context::{Context, RunState};
use crate::state::{State, StateRef};
use mesrun_core::{BoxError, CancellationToken, Clock};
use std::sync::Arc;
use std::time::Duration;

/// Context recording every transition.
pub struct TestContext {
    run: RunState<TestContext>,
    pub switches: usize,
    pub transitions: Vec<String>,
    pub visited: Vec<String>,
    pub counter: u32,
    pub flag: bool,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            run: RunState::new(),
            switches: 0,
            transitions: Vec::new(),
            visited: Vec::new(),
            counter: 0,
            flag: false,
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>, max_time: Duration) -> Self {
        let mut ctx = Self::new();
        ctx.run = RunState::new().with_clock(clock).with_max_time(max_time);
        ctx
    }
}

impl Context for TestContext {
    fn run_state(&self) -> &RunState<Self> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<Self> {
        &mut self.run
    }

    fn on_switch(&mut self, state: &StateRef<Self>) {
        self.switches += 1;
        self.transitions.push(state.name().to_string());
    }
}

type Behavior = Box<dyn Fn(&mut TestContext) -> Result<(), BoxError> + Send + Sync>;

/// Records its name on each visit, runs an optional behavior, then
/// switches to its successor (the end state when none is given).
pub struct Visit {
    name: String,
    next: Option<StateRef<TestContext>>,
    exception_state: Option<StateRef<TestContext>>,
    behavior: Option<Behavior>,
}

impl Visit {
    pub fn new(name: &str, next: Option<StateRef<TestContext>>) -> Self {
        Self {
            name: name.to_string(),
            next,
            exception_state: None,
            behavior: None,
        }
    }

    pub fn with_exception_state(mut self, state: StateRef<TestContext>) -> Self {
        self.exception_state = Some(state);
        self
    }

    pub fn with_behavior<F>(mut self, behavior: F) -> Self
    where
        F: Fn(&mut TestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.behavior = Some(Box::new(behavior));
        self
    }

    pub fn into_ref(self) -> StateRef<TestContext> {
        Arc::new(self)
    }
}

impl State<TestContext> for Visit {
    fn name(&self) -> &str {
        &self.name
    }

    fn perf_name(&self) -> &str {
        &self.name
    }

    fn exception_state(&self) -> Option<StateRef<TestContext>> {
        self.exception_state.clone()
    }

    fn handle(&self, ctx: &mut TestContext, _cancel: &CancellationToken) -> Result<(), BoxError> {
        ctx.visited.push(self.name.clone());
        if let Some(behavior) = &self.behavior {
            behavior(ctx)?;
        }
        match &self.next {
            Some(next) => ctx.switch_to(next.clone()),
            None => ctx.switch_to_end_state(),
        }
        Ok(())
    }
}

/// A state that only records its visit and ends the run.
pub fn noop(name: &str) -> StateRef<TestContext> {
    Visit::new(name, None).into_ref()
}

/// A state that records its visit and continues to `next`.
pub fn visit(name: &str, next: StateRef<TestContext>) -> StateRef<TestContext> {
    Visit::new(name, Some(next)).into_ref()
}
