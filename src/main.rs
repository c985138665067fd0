//! mesrun - periodic multi-machine analysis host
//!
//! Runs the configured command steps for every monitored machine under the
//! engine's admission control and fault policy.

mod command;

use clap::Parser;
use command::CommandStepProvider;
use mesrun_core::CancellationToken;
use mesrun_engine::{
    run_metrics_server, Config, Engine, EngineBuilder, EntityFilter, Metrics,
    PrometheusPerfRecorder, StaticEntityProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mesrun")]
#[command(about = "Periodic multi-machine analysis host")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "MESRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Comma, semicolon or space separated ids of the machines to analyze
    #[arg(short, long, env = "MESRUN_MACHINES")]
    machines: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => {
            tracing::info!("Using default configuration");
            Config::load()?
        }
    };
    if let Some(machines) = &cli.machines {
        config.machines = Some(machines.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_engine(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let steps = CommandStepProvider::new(&config.steps)?;
    tracing::info!("  Entities: {}", config.entities.len());
    tracing::info!("  Steps: {}", steps.len());

    let filter = EntityFilter::parse(config.machines.as_deref().unwrap_or(""));
    let engine = EngineBuilder::new(
        Arc::new(StaticEntityProvider::new(config.entities.clone())),
        Arc::new(steps),
    )
    .config(Arc::new(config.config_set()))
    .filter(filter)
    .perf_recorder(Arc::new(PrometheusPerfRecorder::new(metrics.clone())))
    .metrics(metrics)
    .build()?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e);
        }
    };

    tracing::info!("Starting mesrun");
    let metrics = Arc::new(Metrics::new()?);
    let engine = build_engine(&config, metrics.clone())?;
    let cancel = CancellationToken::new();

    let metrics_handle = if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
        let addr = config.metrics.bind_addr;
        let exit = engine.exit_flag();
        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, exit, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    // Spawn shutdown signal handler
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping engine...");
        shutdown.cancel();
    });

    let result = match engine.run(&cancel).await {
        Ok(never) => match never {},
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            tracing::error!("Engine aborted: {}", e);
            Err(e.into())
        }
    };

    cancel.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("mesrun stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
tunables:
  Engine.Sleep: 100ms
entities:
  - id: 1
    name: Lathe
  - id: 2
    name: Mill
  - id: 3
    name: Press
steps:
  - name: Activity
    program: "true"
"#;

    fn write_config() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_args() {
        let cli = Cli::parse_from(["mesrun", "--config", "/etc/mesrun.yaml", "-m", "1,2"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/mesrun.yaml")));
        assert_eq!(cli.machines.as_deref(), Some("1,2"));
    }

    #[test]
    fn test_machines_argument_filters_entities() {
        let file = write_config();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            machines: Some("2 3".to_string()),
        };
        let config = load_config(&cli).unwrap();
        let engine = build_engine(&config, Arc::new(Metrics::new().unwrap())).unwrap();
        let ids: Vec<u32> = engine.workers().iter().map(|w| w.entity().id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_host_runs_steps_until_cancelled() {
        let file = write_config();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            machines: None,
        };
        let config = load_config(&cli).unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let engine = Arc::new(build_engine(&config, metrics.clone()).unwrap());

        let cancel = CancellationToken::new();
        let handle = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(&cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        cancel.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());

        assert!(metrics.admissions_total.get() >= 3.0);
        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("mesrun_duration_seconds_count{key=\"Analysis.Activity\"}"));
        assert!(!engine.exit_requested());
    }
}
