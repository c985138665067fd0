//! Prometheus metrics for the mesrun engine.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - A [`PerfRecorder`] feeding the duration histogram
//! - HTTP server to expose metrics at `/metrics` and liveness at `/health`

use crate::exit::ExitFlag;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mesrun_core::{BoxError, CancellationToken, FaultClass, PerfRecorder};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Duration histogram buckets (in seconds). Analysis steps range from
/// milliseconds to minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0, 420.0,
];

/// Prometheus metrics for the mesrun engine.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Completed scheduling passes.
    pub passes_total: Counter,
    /// Workers submitted to the pool.
    pub admissions_total: Counter,
    /// Admission waits that ran out, by gate (`threads` or `memory`).
    pub admission_timeouts_total: CounterVec,
    /// Workers currently in flight.
    pub running_workers: Gauge,
    /// Finished worker runs by outcome.
    pub worker_runs_total: CounterVec,
    /// Classified faults by class.
    pub faults_total: CounterVec,
    /// Performance samples by key.
    pub duration: HistogramVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let passes_total = Counter::with_opts(Opts::new(
            "mesrun_passes_total",
            "Total number of scheduling passes",
        ))?;
        registry.register(Box::new(passes_total.clone()))?;

        // Admission
        let admissions_total = Counter::with_opts(Opts::new(
            "mesrun_admissions_total",
            "Total number of workers submitted to the pool",
        ))?;
        registry.register(Box::new(admissions_total.clone()))?;

        let admission_timeouts_total = CounterVec::new(
            Opts::new(
                "mesrun_admission_timeouts_total",
                "Admission waits that reached their maximum, by gate",
            ),
            &["gate"],
        )?;
        registry.register(Box::new(admission_timeouts_total.clone()))?;

        // Workers
        let running_workers = Gauge::with_opts(Opts::new(
            "mesrun_running_workers",
            "Number of workers currently in flight",
        ))?;
        registry.register(Box::new(running_workers.clone()))?;

        let worker_runs_total = CounterVec::new(
            Opts::new("mesrun_worker_runs_total", "Finished worker runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(worker_runs_total.clone()))?;

        let faults_total = CounterVec::new(
            Opts::new("mesrun_faults_total", "Classified faults by class"),
            &["class"],
        )?;
        registry.register(Box::new(faults_total.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "mesrun_duration_seconds",
                "State and step durations in seconds by performance key",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["key"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            passes_total,
            admissions_total,
            admission_timeouts_total,
            running_workers,
            worker_runs_total,
            faults_total,
            duration,
        })
    }

    pub fn record_fault(&self, class: FaultClass) {
        self.faults_total.with_label_values(&[class.as_str()]).inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// [`PerfRecorder`] observing samples into [`Metrics::duration`].
#[derive(Clone)]
pub struct PrometheusPerfRecorder {
    metrics: Arc<Metrics>,
}

impl PrometheusPerfRecorder {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl PerfRecorder for PrometheusPerfRecorder {
    fn record(&self, key: &str, elapsed: Duration) {
        self.metrics
            .duration
            .with_label_values(&[key])
            .observe(elapsed.as_secs_f64());
    }
}

/// Runs the HTTP metrics server until `shutdown` is cancelled.
///
/// `/health` answers 503 once `exit` is requested.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    exit: ExitFlag,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve(listener, metrics, exit, shutdown).await;
    Ok(())
}

async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    exit: ExitFlag,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        let exit = exit.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let exit = exit.clone();
                                async move { handle_request(req, metrics, exit).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

fn response(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    exit: ExitFlag,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => response(
            StatusCode::OK,
            Some("text/plain; version=0.0.4; charset=utf-8"),
            metrics.encode(),
        ),
        "/health" | "/healthz" => {
            if exit.is_requested() {
                response(StatusCode::SERVICE_UNAVAILABLE, None, "EXITING")
            } else {
                response(StatusCode::OK, None, "OK")
            }
        }
        "/" => response(
            StatusCode::OK,
            Some("text/html"),
            r#"<!DOCTYPE html>
<html>
<head><title>mesrun Metrics</title></head>
<body>
<h1>mesrun Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
<p><a href="/health">Health</a></p>
</body>
</html>"#,
        ),
        _ => response(StatusCode::NOT_FOUND, None, "Not Found"),
    };

    Ok(response)
}
