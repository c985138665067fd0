//! # mesrun-engine
//!
//! Periodic multi-machine analysis scheduler.
//!
//! This crate provides:
//! - The scheduling engine: poll loop, admission control, fault policy
//! - Per-entity workers with a mutual-exclusion run guard
//! - A bounded worker pool
//! - The health checker watching workers
//! - Memory introspection, entity and step discovery contracts
//! - Prometheus metrics and the YAML host configuration

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod exit;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod step;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ConfigError, Tunables};
pub use engine::{Engine, EngineBuilder};
pub use entity::{EntityFilter, EntityProvider, MonitoredEntity, StaticEntityProvider};
pub use error::{EngineError, PoolError};
pub use exit::ExitFlag;
pub use health::{AdditionalChecker, HealthChecker, ThreadChecker, Watched};
pub use memory::{MemoryProbe, SysinfoMemoryProbe};
pub use metrics::{run_metrics_server, Metrics, PrometheusPerfRecorder};
pub use pool::WorkerPool;
pub use step::{AnalysisStep, MachineStep, StepProvider};
pub use worker::{Worker, WorkerStatus};
