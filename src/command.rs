//! Analysis steps running an external program per entity.

use mesrun_core::{BoxError, CancellationToken, Cancelled, Fault};
use mesrun_engine::config::StepConfig;
use mesrun_engine::{AnalysisStep, ConfigError, MonitoredEntity, StepProvider};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `program args...` once per pass. `{id}` and `{name}` in the
/// arguments are replaced by the entity's.
#[derive(Debug, Clone)]
pub struct CommandStep {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    entities: Vec<u32>,
    bound_args: Vec<String>,
}

impl CommandStep {
    pub fn from_config(config: &StepConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout()?,
            entities: config.entities.clone(),
            bound_args: Vec::new(),
        })
    }
}

impl AnalysisStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, entity: &MonitoredEntity) -> bool {
        if !self.entities.is_empty() && !self.entities.contains(&entity.id) {
            return false;
        }
        let id = entity.id.to_string();
        self.bound_args = self
            .args
            .iter()
            .map(|arg| arg.replace("{id}", &id).replace("{name}", &entity.name))
            .collect();
        true
    }

    fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let mut child = Command::new(&self.program)
            .args(&self.bound_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                BoxError::from(
                    Fault::temporary_with_delay(format!("cannot start {}", self.program))
                        .with_source(e),
                )
            })?;

        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                tracing::warn!("{} cancelled, killing {}", self.name, self.program);
                let _ = child.kill();
                let _ = child.wait();
                return Err(Cancelled.into());
            }

            if start.elapsed() > self.timeout {
                tracing::warn!(
                    "{} timed out after {:?}, killing {}",
                    self.name,
                    self.timeout,
                    self.program
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(BoxError::from(Fault::timeout(format!(
                    "{} did not finish within {:?}",
                    self.name, self.timeout
                ))));
            }

            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(BoxError::from(Fault::invalid(format!(
                        "{} exited with {}",
                        self.name, status
                    ))));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(BoxError::from(
                        Fault::temporary(format!("waiting for {} failed", self.program))
                            .with_source(e),
                    ));
                }
            }
        }
    }
}

/// Gives every entity a copy of the configured command steps.
pub struct CommandStepProvider {
    templates: Vec<CommandStep>,
}

impl CommandStepProvider {
    pub fn new(configs: &[StepConfig]) -> Result<Self, ConfigError> {
        let templates = configs
            .iter()
            .map(CommandStep::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { templates })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

impl StepProvider for CommandStepProvider {
    fn steps(&self, _entity: &MonitoredEntity) -> Vec<Box<dyn AnalysisStep>> {
        self.templates
            .iter()
            .map(|step| Box::new(step.clone()) as Box<dyn AnalysisStep>)
            .collect()
    }
}
