//! Units of work run by a worker for its entity.

use crate::entity::MonitoredEntity;
use mesrun_core::{BoxError, CancellationToken};
use mesrun_statemachine::{Context, StateMachine};

/// One analysis step of a worker, run once per pass.
pub trait AnalysisStep: Send {
    /// Display name, also used in the performance key.
    fn name(&self) -> &str;

    /// Binds the step to `entity`. Returns false when the step does not
    /// apply to it; such a step is dropped.
    fn initialize(&mut self, entity: &MonitoredEntity) -> bool {
        let _ = entity;
        true
    }

    fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), BoxError>;
}

/// Provides the candidate steps of an entity, in execution order.
pub trait StepProvider: Send + Sync {
    fn steps(&self, entity: &MonitoredEntity) -> Vec<Box<dyn AnalysisStep>>;
}

impl<F> StepProvider for F
where
    F: Fn(&MonitoredEntity) -> Vec<Box<dyn AnalysisStep>> + Send + Sync,
{
    fn steps(&self, entity: &MonitoredEntity) -> Vec<Box<dyn AnalysisStep>> {
        self(entity)
    }
}

type EntityPredicate = Box<dyn Fn(&MonitoredEntity) -> bool + Send>;

/// Runs a state machine over its own context as a step.
pub struct MachineStep<C: Context> {
    name: String,
    machine: StateMachine<C>,
    context: C,
    accepts: Option<EntityPredicate>,
}

impl<C: Context> MachineStep<C> {
    pub fn new(name: impl Into<String>, machine: StateMachine<C>, context: C) -> Self {
        Self {
            name: name.into(),
            machine,
            context,
            accepts: None,
        }
    }

    /// Restricts the step to the entities accepted by `accepts`.
    pub fn with_entity_filter<F>(mut self, accepts: F) -> Self
    where
        F: Fn(&MonitoredEntity) -> bool + Send + 'static,
    {
        self.accepts = Some(Box::new(accepts));
        self
    }

    pub fn context(&self) -> &C {
        &self.context
    }
}

impl<C: Context> AnalysisStep for MachineStep<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, entity: &MonitoredEntity) -> bool {
        self.accepts.as_ref().map_or(true, |accepts| accepts(entity))
    }

    fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let completed = self.machine.run(&mut self.context, cancel)?;
        if !completed {
            tracing::debug!("{} ended early", self.machine.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesrun_core::{is_cancellation, BoxError, Fault};
    use mesrun_statemachine::{ActionState, EndState, RunState, StateRef};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        run: RunState<Counter>,
        count: u32,
    }

    impl Context for Counter {
        fn run_state(&self) -> &RunState<Self> {
            &self.run
        }

        fn run_state_mut(&mut self) -> &mut RunState<Self> {
            &mut self.run
        }
    }

    fn counting_machine(fail: bool) -> StateMachine<Counter> {
        let end: StateRef<Counter> = Arc::new(EndState::new());
        let count: StateRef<Counter> = Arc::new(ActionState::new(
            "Count",
            move |ctx: &mut Counter, _: &CancellationToken| -> Result<(), BoxError> {
                ctx.count += 1;
                if fail {
                    return Err(Box::new(Fault::invalid("bad counter")));
                }
                Ok(())
            },
            end,
        ));
        StateMachine::new("Counting", count)
    }

    #[test]
    fn test_machine_step_runs_machine() {
        let mut step = MachineStep::new("Count", counting_machine(false), Counter::default());
        assert_eq!(step.name(), "Count");
        assert!(step.initialize(&MonitoredEntity::new(1, "Lathe")));

        let cancel = CancellationToken::new();
        step.run_once(&cancel).unwrap();
        step.run_once(&cancel).unwrap();
        assert_eq!(step.context().count, 2);
    }

    #[test]
    fn test_machine_step_entity_filter() {
        let mut step = MachineStep::new("Count", counting_machine(false), Counter::default())
            .with_entity_filter(|e| e.id != 2);
        assert!(step.initialize(&MonitoredEntity::new(1, "Lathe")));
        assert!(!step.initialize(&MonitoredEntity::new(2, "Mill")));
    }

    #[test]
    fn test_machine_step_propagates_errors() {
        let mut step = MachineStep::new("Count", counting_machine(true), Counter::default());
        assert!(step.run_once(&CancellationToken::new()).is_err());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = step.run_once(&cancel).unwrap_err();
        assert!(is_cancellation(&*err));
    }

    #[test]
    fn test_closure_step_provider() {
        let provider = |_: &MonitoredEntity| -> Vec<Box<dyn AnalysisStep>> {
            vec![Box::new(MachineStep::new(
                "Count",
                counting_machine(false),
                Counter::default(),
            ))]
        };
        assert_eq!(provider.steps(&MonitoredEntity::new(1, "Lathe")).len(), 1);
    }
}
