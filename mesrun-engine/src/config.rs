//! Engine configuration.
//!
//! Tunables are read by key through a [`ConfigSet`] each time they are
//! needed, see [`keys`] for the names and defaults.
//!
//! The host configuration file is loaded in the following order (later
//! overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MESRUN_CONFIG or --config)
//! 3. Environment variables

use crate::entity::MonitoredEntity;
use mesrun_core::config::parse_duration;
use mesrun_core::{ConfigSet, ConfigSetExt, EnvConfigSet, LayeredConfigSet, MemoryConfigSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration keys and their defaults.
pub mod keys {
    use std::time::Duration;

    /// Time after which a running worker without activity is reported.
    pub const NOT_RESPONDING_TIMEOUT: &str = "Engine.NotRespondingTimeout";
    pub const NOT_RESPONDING_TIMEOUT_DEFAULT: Duration = Duration::from_secs(7 * 60);

    /// Size of the worker pool.
    pub const MAX_THREADS_IN_POOL: &str = "Engine.MaxThreadsInPool";
    pub const MAX_THREADS_IN_POOL_DEFAULT: usize = 20;

    /// Ceiling on workers in flight checked before each admission.
    pub const MAX_RUNNING_MACHINE_THREADS: &str = "Engine.MaxRunningMachineThreads";
    pub const MAX_RUNNING_MACHINE_THREADS_DEFAULT: usize = 4;

    /// Percentage of physical memory above which the engine exits.
    pub const MEMORY_PERCENTAGE_EXIT: &str = "Engine.MemoryPercentageExit";
    pub const MEMORY_PERCENTAGE_EXIT_DEFAULT: u64 = 40;

    /// Percentage of physical memory above which no new work is admitted.
    pub const MEMORY_PERCENTAGE_STOP_NEW_THREADS: &str = "Engine.MemoryPercentageStopNewThreads";
    pub const MEMORY_PERCENTAGE_STOP_NEW_THREADS_DEFAULT: u64 = 30;

    pub const SLEEP_MAX_RUNNING_THREADS: &str = "Machine.SleepMaxRunningThreads";
    pub const SLEEP_MAX_RUNNING_THREADS_DEFAULT: Duration = Duration::from_millis(100);

    pub const MAX_WAIT_THREAD: &str = "Machine.MaxWaitThread";
    pub const MAX_WAIT_THREAD_DEFAULT: Duration = Duration::from_secs(3 * 60);

    pub const SLEEP_FREE_MEMORY: &str = "Machine.SleepFreeMemory";
    pub const SLEEP_FREE_MEMORY_DEFAULT: Duration = Duration::from_millis(100);

    pub const MAX_WAIT_FREE_MEMORY: &str = "Machine.MaxWaitFreeMemory";
    pub const MAX_WAIT_FREE_MEMORY_DEFAULT: Duration = Duration::from_secs(3 * 60);

    /// Pass frequency.
    pub const ENGINE_SLEEP: &str = "Engine.Sleep";
    pub const ENGINE_SLEEP_DEFAULT: Duration = Duration::from_secs(2);

    pub const TEMPORARY_WITH_DELAY_SLEEP: &str = "TemporaryWithDelayException.Sleep";
    pub const TEMPORARY_WITH_DELAY_SLEEP_DEFAULT: Duration = Duration::from_secs(5);

    pub const SLEEP_BETWEEN_PLUGINS: &str = "Sleep.BetweenPlugins";
    pub const SLEEP_BETWEEN_PLUGINS_DEFAULT: Duration = Duration::ZERO;

    /// Idle delay after an unclassified engine-level fault.
    pub const SLEEP_ERROR: &str = "Sleep.Error";
    pub const SLEEP_ERROR_DEFAULT: Duration = Duration::from_secs(1);

    /// Health check period.
    pub const NOT_RESPONDING_FREQUENCY: &str = "Engine.NotResponding.Frequency";
    pub const NOT_RESPONDING_FREQUENCY_DEFAULT: Duration = Duration::from_secs(10);
}

/// Snapshot of the tunables, re-read at the start of every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    pub not_responding_timeout: Duration,
    pub max_threads_in_pool: usize,
    pub max_running_machine_threads: usize,
    pub memory_percentage_exit: u64,
    pub memory_percentage_stop_new_threads: u64,
    pub sleep_max_running_threads: Duration,
    pub max_wait_thread: Duration,
    pub sleep_free_memory: Duration,
    pub max_wait_free_memory: Duration,
    pub frequency: Duration,
    pub temporary_with_delay_sleep: Duration,
    pub sleep_between_plugins: Duration,
    pub sleep_error: Duration,
    pub not_responding_frequency: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            not_responding_timeout: keys::NOT_RESPONDING_TIMEOUT_DEFAULT,
            max_threads_in_pool: keys::MAX_THREADS_IN_POOL_DEFAULT,
            max_running_machine_threads: keys::MAX_RUNNING_MACHINE_THREADS_DEFAULT,
            memory_percentage_exit: keys::MEMORY_PERCENTAGE_EXIT_DEFAULT,
            memory_percentage_stop_new_threads: keys::MEMORY_PERCENTAGE_STOP_NEW_THREADS_DEFAULT,
            sleep_max_running_threads: keys::SLEEP_MAX_RUNNING_THREADS_DEFAULT,
            max_wait_thread: keys::MAX_WAIT_THREAD_DEFAULT,
            sleep_free_memory: keys::SLEEP_FREE_MEMORY_DEFAULT,
            max_wait_free_memory: keys::MAX_WAIT_FREE_MEMORY_DEFAULT,
            frequency: keys::ENGINE_SLEEP_DEFAULT,
            temporary_with_delay_sleep: keys::TEMPORARY_WITH_DELAY_SLEEP_DEFAULT,
            sleep_between_plugins: keys::SLEEP_BETWEEN_PLUGINS_DEFAULT,
            sleep_error: keys::SLEEP_ERROR_DEFAULT,
            not_responding_frequency: keys::NOT_RESPONDING_FREQUENCY_DEFAULT,
        }
    }
}

impl Tunables {
    /// Reads every tunable, falling back to its default.
    pub fn load(config: &dyn ConfigSet) -> Self {
        let d = Self::default();
        Self {
            not_responding_timeout: config
                .load_and_get(keys::NOT_RESPONDING_TIMEOUT, d.not_responding_timeout),
            max_threads_in_pool: config
                .load_and_get(keys::MAX_THREADS_IN_POOL, d.max_threads_in_pool)
                .max(1),
            max_running_machine_threads: config
                .load_and_get(keys::MAX_RUNNING_MACHINE_THREADS, d.max_running_machine_threads)
                .max(1),
            memory_percentage_exit: config
                .load_and_get(keys::MEMORY_PERCENTAGE_EXIT, d.memory_percentage_exit),
            memory_percentage_stop_new_threads: config.load_and_get(
                keys::MEMORY_PERCENTAGE_STOP_NEW_THREADS,
                d.memory_percentage_stop_new_threads,
            ),
            sleep_max_running_threads: config
                .load_and_get(keys::SLEEP_MAX_RUNNING_THREADS, d.sleep_max_running_threads),
            max_wait_thread: config.load_and_get(keys::MAX_WAIT_THREAD, d.max_wait_thread),
            sleep_free_memory: config.load_and_get(keys::SLEEP_FREE_MEMORY, d.sleep_free_memory),
            max_wait_free_memory: config
                .load_and_get(keys::MAX_WAIT_FREE_MEMORY, d.max_wait_free_memory),
            frequency: config.load_and_get(keys::ENGINE_SLEEP, d.frequency),
            temporary_with_delay_sleep: config
                .load_and_get(keys::TEMPORARY_WITH_DELAY_SLEEP, d.temporary_with_delay_sleep),
            sleep_between_plugins: config
                .load_and_get(keys::SLEEP_BETWEEN_PLUGINS, d.sleep_between_plugins),
            sleep_error: config.load_and_get(keys::SLEEP_ERROR, d.sleep_error),
            not_responding_frequency: config
                .load_and_get(keys::NOT_RESPONDING_FREQUENCY, d.not_responding_frequency),
        }
    }
}

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunables by key, e.g. `Engine.Sleep: 2s`.
    pub tunables: BTreeMap<String, serde_yaml::Value>,
    /// Comma, semicolon or space separated allow-list of entity ids.
    pub machines: Option<String>,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Monitored entities.
    pub entities: Vec<MonitoredEntity>,
    /// Command steps run for every entity.
    pub steps: Vec<StepConfig>,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MESRUN_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(machines) = std::env::var("MESRUN_MACHINES") {
            self.machines = Some(machines);
        }
        self.metrics.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks entity ids, steps and tunable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for entity in &self.entities {
            if !ids.insert(entity.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate entity id {}",
                    entity.id
                )));
            }
        }

        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "step without a name".to_string(),
                ));
            }
            if step.program.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "step '{}' has no program",
                    step.name
                )));
            }
            step.timeout()?;
        }

        for (key, value) in &self.tunables {
            if scalar_to_string(value).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "tunable '{}' must be a scalar",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Key/value view of the tunables, environment first.
    pub fn config_set(&self) -> LayeredConfigSet {
        let file: MemoryConfigSet = self
            .tunables
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
            .collect();
        LayeredConfigSet::new().layer(EnvConfigSet).layer(file)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// An external program run once per entity and pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Display name, also used in the performance key.
    pub name: String,
    /// Program to run.
    pub program: String,
    /// Arguments; `{id}` and `{name}` are replaced by the entity's.
    #[serde(default)]
    pub args: Vec<String>,
    /// Maximum duration of one run.
    #[serde(default = "default_step_timeout")]
    pub timeout: String,
    /// Entities this step applies to; empty means all.
    #[serde(default)]
    pub entities: Vec<u32>,
}

fn default_step_timeout() -> String {
    "5m".to_string()
}

impl StepConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.timeout).map_err(|e| {
            ConfigError::ValidationError(format!("step '{}' timeout: {}", self.name, e))
        })
    }

    pub fn applies_to(&self, entity_id: u32) -> bool {
        self.entities.is_empty() || self.entities.contains(&entity_id)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("MESRUN_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("MESRUN_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
