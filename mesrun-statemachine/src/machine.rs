//! State machine runner.
//!
//! [`StateMachine::run`] drives a context from its initial state until a
//! terminal state is reached. A failing state is routed to its exception
//! state when it has one; cancellation and exit-requiring faults always
//! propagate. The initial state is switched to again when the run ends,
//! whatever the outcome, so the context is ready for the next run.

use crate::context::Context;
use crate::error::StateMachineError;
use crate::state::{State, StateRef};
use mesrun_core::{
    is_cancellation, BoxError, CancellationToken, ErrorClassification, NoopPerfRecorder,
    PerfRecorder, PerfSample,
};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// How a run ended, passed to [`StateMachineDefinition::on_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A terminal state was reached.
    Completed,
    /// The definition stopped the run early.
    Stopped,
    Cancelled,
    Failed,
}

/// Decision of [`StateMachineDefinition::manage_exception`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDecision {
    /// Switch to the exception state if any, else fail the run.
    Default,
    /// The exception is expected: the state must have an exception state.
    Recover,
    /// End the run now; `run` returns `false`.
    Stop,
}

/// Customization points of the advanced runner.
pub trait StateMachineDefinition<C: Context>: Send + Sync {
    /// Key of the performance sample wrapping one state execution. Empty
    /// disables sampling.
    fn perf_key(&self, state: &dyn State<C>) -> String {
        let perf_name = state.perf_name();
        if perf_name.is_empty() {
            String::new()
        } else {
            format!("StateMachine.{}", perf_name)
        }
    }

    /// Called after every successful state execution. Returning `false`
    /// stops the run.
    fn on_state_success(&self, _ctx: &mut C, _state: &dyn State<C>) -> bool {
        true
    }

    fn manage_exception(
        &self,
        _ctx: &C,
        _state: &dyn State<C>,
        _error: &(dyn Error + 'static),
    ) -> ExceptionDecision {
        ExceptionDecision::Default
    }

    /// Called once at the end of every run, after the context is back on
    /// its initial state.
    fn on_end(&self, _ctx: &mut C, _outcome: RunOutcome) {}
}

/// Definition with no customization.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicDefinition;

impl<C: Context> StateMachineDefinition<C> for BasicDefinition {}

enum Step {
    Continue,
    Stop,
}

/// Binds an initial state to the runner configuration.
pub struct StateMachine<C: Context> {
    name: String,
    initial: StateRef<C>,
    classification: Arc<ErrorClassification>,
    perf: Arc<dyn PerfRecorder>,
    definition: Arc<dyn StateMachineDefinition<C>>,
}

impl<C: Context> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("initial", &self.initial.name())
            .finish()
    }
}

impl<C: Context> StateMachine<C> {
    pub fn new(name: impl Into<String>, initial: StateRef<C>) -> Self {
        Self {
            name: name.into(),
            initial,
            classification: Arc::new(ErrorClassification::new()),
            perf: Arc::new(NoopPerfRecorder),
            definition: Arc::new(BasicDefinition),
        }
    }

    pub fn with_classification(mut self, classification: Arc<ErrorClassification>) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_perf_recorder(mut self, perf: Arc<dyn PerfRecorder>) -> Self {
        self.perf = perf;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &StateRef<C> {
        &self.initial
    }

    /// Runs the machine to completion.
    ///
    /// Returns `Ok(true)` when a terminal state was reached, `Ok(false)`
    /// when the run was stopped early by the definition.
    pub fn run(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<bool, StateMachineError> {
        if cancel.is_cancelled() {
            return Err(StateMachineError::Cancelled(mesrun_core::Cancelled));
        }

        let depth = ctx.run_state_mut().take_composite_depth();
        let start = ctx.now();
        ctx.run_state_mut().set_start(Some(start));
        tracing::debug!("{}: start", self.name);
        ctx.switch_to(self.initial.clone());

        let result = self.run_loop(ctx, cancel);

        ctx.switch_to(self.initial.clone());
        let outcome = match &result {
            Ok(true) => RunOutcome::Completed,
            Ok(false) => RunOutcome::Stopped,
            Err(StateMachineError::Cancelled(_)) => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        };
        self.definition.on_end(ctx, outcome);
        ctx.run_state_mut().set_start(None);
        ctx.run_state_mut().restore_composite_depth(depth);
        tracing::debug!("{}: end ({:?})", self.name, outcome);

        if cancel.is_cancelled() && !matches!(result, Err(StateMachineError::Cancelled(_))) {
            return Err(StateMachineError::Cancelled(mesrun_core::Cancelled));
        }
        result
    }

    fn run_loop(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<bool, StateMachineError> {
        loop {
            let state = ctx.current_state();
            if state.is_terminal() {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                tracing::info!("{}: cancelled in state {}", self.name, state.name());
                return Err(StateMachineError::Cancelled(mesrun_core::Cancelled));
            }
            match self.execute(ctx, &state, cancel)? {
                Step::Continue => {}
                Step::Stop => {
                    tracing::debug!("{}: stopped after state {}", self.name, state.name());
                    ctx.switch_to_end_state();
                    return Ok(false);
                }
            }
        }
    }

    fn execute(
        &self,
        ctx: &mut C,
        state: &StateRef<C>,
        cancel: &CancellationToken,
    ) -> Result<Step, StateMachineError> {
        let result = {
            let _sample = PerfSample::start(self.perf.clone(), self.definition.perf_key(&**state));
            state.handle(ctx, cancel)
        };

        let error = match result {
            Ok(()) => {
                return Ok(if self.definition.on_state_success(ctx, &**state) {
                    Step::Continue
                } else {
                    Step::Stop
                });
            }
            Err(error) => error,
        };

        self.manage_exception(ctx, state, error)
    }

    fn manage_exception(
        &self,
        ctx: &mut C,
        state: &StateRef<C>,
        error: BoxError,
    ) -> Result<Step, StateMachineError> {
        let err: &(dyn Error + 'static) = &*error;
        if is_cancellation(err) {
            return Err(StateMachineError::Cancelled(mesrun_core::Cancelled));
        }
        if self.classification.requires_exit(err) {
            tracing::error!("{}: state {} requires to exit: {}", self.name, state.name(), err);
            return Err(StateMachineError::Aborted {
                state: state.name().to_string(),
                source: error,
            });
        }

        match self.definition.manage_exception(ctx, &**state, err) {
            ExceptionDecision::Stop => {
                tracing::info!("{}: exception in state {} ends the run: {}", self.name, state.name(), err);
                Ok(Step::Stop)
            }
            ExceptionDecision::Recover => match state.exception_state() {
                Some(exception_state) => {
                    tracing::info!(
                        "{}: expected exception in state {}, switch to {}: {}",
                        self.name,
                        state.name(),
                        exception_state.name(),
                        err
                    );
                    ctx.switch_to(exception_state);
                    Ok(Step::Continue)
                }
                None => {
                    tracing::error!(
                        "{}: expected exception in state {} but no exception state: {}",
                        self.name,
                        state.name(),
                        err
                    );
                    Err(StateMachineError::MissingExceptionState {
                        state: state.name().to_string(),
                        source: error,
                    })
                }
            },
            ExceptionDecision::Default => match state.exception_state() {
                Some(exception_state) => {
                    tracing::warn!(
                        "{}: exception in state {}, switch to {}: {}",
                        self.name,
                        state.name(),
                        exception_state.name(),
                        err
                    );
                    ctx.switch_to(exception_state);
                    Ok(Step::Continue)
                }
                None => {
                    tracing::error!("{}: exception in state {}: {}", self.name, state.name(), err);
                    Err(StateMachineError::State {
                        state: state.name().to_string(),
                        source: error,
                    })
                }
            },
        }
    }
}

/// Runner driven by a [`StateMachineDefinition`].
pub struct AdvancedStateMachine<C: Context> {
    machine: StateMachine<C>,
}

impl<C: Context> AdvancedStateMachine<C> {
    pub fn new(
        name: impl Into<String>,
        initial: StateRef<C>,
        definition: Arc<dyn StateMachineDefinition<C>>,
    ) -> Self {
        let mut machine = StateMachine::new(name, initial);
        machine.definition = definition;
        Self { machine }
    }

    pub fn with_classification(mut self, classification: Arc<ErrorClassification>) -> Self {
        self.machine = self.machine.with_classification(classification);
        self
    }

    pub fn with_perf_recorder(mut self, perf: Arc<dyn PerfRecorder>) -> Self {
        self.machine = self.machine.with_perf_recorder(perf);
        self
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn run(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<bool, StateMachineError> {
        self.machine.run(ctx, cancel)
    }

    /// The underlying runner, for embedding in a nested state.
    pub fn into_inner(self) -> StateMachine<C> {
        self.machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ActionState, EndState};
    use crate::testing::{noop, visit, TestContext, Visit};
    use mesrun_core::{AbortError, Cancelled, Fault, FaultKind};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn counting_initial(next: StateRef<TestContext>) -> StateRef<TestContext> {
        Arc::new(ActionState::new(
            "Initial",
            |c: &mut TestContext, _| {
                c.counter += 1;
                Ok(())
            },
            next,
        ))
    }

    fn failing(name: &str, fault: fn() -> Fault) -> Visit {
        Visit::new(name, None).with_behavior(move |_| Err(Box::new(fault()) as BoxError))
    }

    #[test]
    fn test_run_reaches_terminal() {
        let initial = counting_initial(visit("A", noop("B")));
        let machine = StateMachine::new("Test", initial);
        let mut ctx = TestContext::new();

        assert!(machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.counter, 1);
        assert_eq!(ctx.visited, vec!["A", "B"]);
        assert_eq!(ctx.current_state().name(), "Initial");
        assert!(ctx.start_date_time().is_none());
        // start, A, B, End, back to initial
        assert_eq!(ctx.transitions, vec!["Initial", "A", "B", "End", "Initial"]);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let initial = counting_initial(visit("A", noop("B")));
        let machine = StateMachine::new("Test", initial);
        let mut ctx = TestContext::new();
        let cancel = CancellationToken::new();

        assert!(machine.run(&mut ctx, &cancel).unwrap());
        let first = std::mem::take(&mut ctx.transitions);
        assert!(machine.run(&mut ctx, &cancel).unwrap());
        assert_eq!(first, ctx.transitions);
        assert_eq!(ctx.counter, 2);
    }

    #[test]
    fn test_exception_state_recovers() {
        let a = failing("A", || Fault::temporary("db busy"))
            .with_exception_state(noop("Recovery"))
            .into_ref();
        let machine = StateMachine::new("Test", counting_initial(a));
        let mut ctx = TestContext::new();

        assert!(machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.visited, vec!["A", "Recovery"]);
        assert_eq!(ctx.counter, 1);
    }

    #[test]
    fn test_no_exception_state_fails_run() {
        let a = failing("A", || Fault::invalid("bad slot")).into_ref();
        let machine = StateMachine::new("Test", counting_initial(a));
        let mut ctx = TestContext::new();

        let err = machine.run(&mut ctx, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, StateMachineError::State { ref state, .. } if state == "A"));
        let fault = err
            .source()
            .and_then(|e| e.downcast_ref::<Fault>())
            .unwrap();
        assert_eq!(fault.kind, FaultKind::Invalid);
        assert_eq!(ctx.current_state().name(), "Initial");
        assert_eq!(ctx.counter, 1);
        assert!(ctx.start_date_time().is_none());
    }

    #[test]
    fn test_abort_bypasses_exception_state() {
        let a = Visit::new("A", None)
            .with_behavior(|_| Err(Box::new(AbortError::new("corrupted")) as BoxError))
            .with_exception_state(noop("Recovery"))
            .into_ref();
        let machine = StateMachine::new("Test", counting_initial(a));
        let mut ctx = TestContext::new();

        let err = machine.run(&mut ctx, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, StateMachineError::Aborted { .. }));
        assert_eq!(ctx.visited, vec!["A"]);
        assert_eq!(ctx.current_state().name(), "Initial");
    }

    #[test]
    fn test_cancellation_error_propagates() {
        let a = Visit::new("A", None)
            .with_behavior(|_| Err(Box::new(Cancelled) as BoxError))
            .with_exception_state(noop("Recovery"))
            .into_ref();
        let machine = StateMachine::new("Test", counting_initial(a));
        let mut ctx = TestContext::new();

        let err = machine.run(&mut ctx, &CancellationToken::new()).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctx.current_state().name(), "Initial");
    }

    #[test]
    fn test_cancelled_before_start() {
        let machine = StateMachine::new("Test", counting_initial(noop("A")));
        let mut ctx = TestContext::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = machine.run(&mut ctx, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctx.switches, 0);
    }

    #[test]
    fn test_cancelled_during_run() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let a = Visit::new("A", Some(noop("B")))
            .with_behavior(move |_| {
                c.cancel();
                Ok(())
            })
            .into_ref();
        let machine = StateMachine::new("Test", counting_initial(a));
        let mut ctx = TestContext::new();

        let err = machine.run(&mut ctx, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctx.visited, vec!["A"]);
        assert_eq!(ctx.current_state().name(), "Initial");
        assert_eq!(ctx.counter, 1);
    }

    #[derive(Default)]
    struct Recording {
        keys: Mutex<Vec<String>>,
    }

    impl PerfRecorder for Recording {
        fn record(&self, key: &str, _elapsed: Duration) {
            self.keys.lock().push(key.to_string());
        }
    }

    #[test]
    fn test_perf_keys() {
        let perf = Arc::new(Recording::default());
        let machine = StateMachine::new("Test", counting_initial(noop("A")))
            .with_perf_recorder(perf.clone());
        let mut ctx = TestContext::new();
        machine.run(&mut ctx, &CancellationToken::new()).unwrap();
        assert_eq!(
            *perf.keys.lock(),
            vec!["StateMachine.Initial".to_string(), "StateMachine.A".to_string()]
        );
    }

    struct StopAfter {
        stop_after: &'static str,
        outcomes: Mutex<Vec<RunOutcome>>,
    }

    impl StateMachineDefinition<TestContext> for StopAfter {
        fn perf_key(&self, state: &dyn State<TestContext>) -> String {
            format!("Custom.{}", state.name())
        }

        fn on_state_success(&self, _ctx: &mut TestContext, state: &dyn State<TestContext>) -> bool {
            state.name() != self.stop_after
        }

        fn manage_exception(
            &self,
            _ctx: &TestContext,
            _state: &dyn State<TestContext>,
            error: &(dyn Error + 'static),
        ) -> ExceptionDecision {
            match error.downcast_ref::<Fault>().map(|f| f.kind) {
                Some(FaultKind::NotError) => ExceptionDecision::Stop,
                Some(FaultKind::Stale) => ExceptionDecision::Recover,
                _ => ExceptionDecision::Default,
            }
        }

        fn on_end(&self, ctx: &mut TestContext, outcome: RunOutcome) {
            assert_eq!(ctx.current_state().name(), "Initial");
            self.outcomes.lock().push(outcome);
        }
    }

    fn definition(stop_after: &'static str) -> Arc<StopAfter> {
        Arc::new(StopAfter {
            stop_after,
            outcomes: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_advanced_success_hook_stops_run() {
        let def = definition("A");
        let perf = Arc::new(Recording::default());
        let machine = AdvancedStateMachine::new(
            "Advanced",
            counting_initial(visit("A", noop("B"))),
            def.clone(),
        )
        .with_perf_recorder(perf.clone());
        let mut ctx = TestContext::new();

        assert!(!machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.visited, vec!["A"]);
        assert_eq!(*def.outcomes.lock(), vec![RunOutcome::Stopped]);
        assert_eq!(
            *perf.keys.lock(),
            vec!["Custom.Initial".to_string(), "Custom.A".to_string()]
        );
        // forced to the end state, then back to the initial state
        assert_eq!(ctx.transitions[ctx.transitions.len() - 2], "End");
    }

    #[test]
    fn test_advanced_stop_on_exception() {
        let def = definition("");
        let a = failing("A", || Fault::not_error("nothing to do"))
            .with_exception_state(noop("Recovery"))
            .into_ref();
        let machine = AdvancedStateMachine::new("Advanced", counting_initial(a), def.clone());
        let mut ctx = TestContext::new();

        assert!(!machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.visited, vec!["A"]);
        assert_eq!(*def.outcomes.lock(), vec![RunOutcome::Stopped]);
    }

    #[test]
    fn test_advanced_recover_requires_exception_state() {
        let def = definition("");
        let a = failing("A", || Fault::stale("reload")).into_ref();
        let machine = AdvancedStateMachine::new("Advanced", counting_initial(a), def.clone());
        let mut ctx = TestContext::new();

        let err = machine.run(&mut ctx, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, StateMachineError::MissingExceptionState { .. }));
        assert_eq!(*def.outcomes.lock(), vec![RunOutcome::Failed]);

        let a = failing("A", || Fault::stale("reload"))
            .with_exception_state(noop("Reload"))
            .into_ref();
        let machine = AdvancedStateMachine::new("Advanced", counting_initial(a), def.clone());
        assert!(machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.visited, vec!["A", "A", "Reload"]);
    }

    #[test]
    fn test_initial_terminal_state_completes() {
        let machine = StateMachine::new("Empty", Arc::new(EndState::<TestContext>::new()));
        let mut ctx = TestContext::new();
        assert!(machine.run(&mut ctx, &CancellationToken::new()).unwrap());
        assert_eq!(ctx.switches, 2);
    }
}
