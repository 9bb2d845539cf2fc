//! Process-wide controller metrics, served over a small `hyper` HTTP server.
//!
//! Matches the shape established for this workspace's other controllers
//! (`reconcile_counter`, `read_histogram`, `action_counter`, `write_histogram`),
//! extended with counters for the build/validation/comparison subsystems this
//! controller adds.

#![cfg(feature = "metrics")]

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
};
use tokio::net::TcpListener;

use crate::util::Error;

/// Counters and histograms shared by every reconcile invocation.
pub struct ControllerMetrics {
    registry: Registry,
    pub reconcile_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub action_counter: IntCounterVec,
    pub write_histogram: HistogramVec,
    pub validation_jobs: IntCounterVec,
    pub validation_duration: HistogramVec,
    pub active_validation_pods: IntGaugeVec,
    pub build_duration: HistogramVec,
    pub work_queue_depth: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let registry = Registry::new();
        let reconcile_counter = register_int_counter_vec_with_registry!(
            format!("{subsystem}_reconcile_total"),
            "Total number of reconciles processed",
            &["name", "namespace"],
            registry
        )
        .unwrap();
        let read_histogram = register_histogram_vec_with_registry!(
            format!("{subsystem}_read_duration_seconds"),
            "Duration of the read phase of reconciliation",
            &["name", "namespace", "action"],
            registry
        )
        .unwrap();
        let action_counter = register_int_counter_vec_with_registry!(
            format!("{subsystem}_action_total"),
            "Total number of actions taken during reconciliation",
            &["name", "namespace", "action"],
            registry
        )
        .unwrap();
        let write_histogram = register_histogram_vec_with_registry!(
            format!("{subsystem}_write_duration_seconds"),
            "Duration of the write phase of reconciliation",
            &["name", "namespace", "action"],
            registry
        )
        .unwrap();
        let validation_jobs = register_int_counter_vec_with_registry!(
            format!("{subsystem}_validation_jobs_total"),
            "Total number of ValidationJob phase observations",
            &["phase"],
            registry
        )
        .unwrap();
        let validation_duration = register_histogram_vec_with_registry!(
            format!("{subsystem}_validation_duration_seconds"),
            "Duration of notebook validation pod execution",
            &["result"],
            registry
        )
        .unwrap();
        let active_validation_pods = register_int_gauge_vec_with_registry!(
            format!("{subsystem}_active_validation_pods"),
            "Number of validation pods currently running",
            &["namespace"],
            registry
        )
        .unwrap();
        let build_duration = register_histogram_vec_with_registry!(
            format!("{subsystem}_build_duration_seconds"),
            "Duration of image builds",
            &["strategy", "result"],
            registry
        )
        .unwrap();
        let work_queue_depth = register_int_gauge_vec_with_registry!(
            format!("{subsystem}_work_queue_depth"),
            "Number of ValidationJob reconciles currently in flight",
            &["namespace"],
            registry
        )
        .unwrap();
        ControllerMetrics {
            registry,
            reconcile_counter,
            read_histogram,
            action_counter,
            write_histogram,
            validation_jobs,
            validation_duration,
            active_validation_pods,
            build_duration,
            work_queue_depth,
        }
    }

    fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

async fn serve(
    metrics: std::sync::Arc<ControllerMetrics>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = match req.uri().path() {
        "/healthz" | "/readyz" => "ok".to_string(),
        "/metrics" => metrics.render(),
        _ => {
            return Ok(Response::builder()
                .status(404)
                .body(Full::new(Bytes::from_static(b"not found")))
                .unwrap());
        }
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Binds the metrics/health HTTP server to `bind_address` and serves until the
/// process is signaled to shut down.
pub async fn run_metrics_server(
    bind_address: &str,
    metrics: std::sync::Arc<ControllerMetrics>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(bind_address).await.map_err(|e| {
        eprintln!(
            "{}",
            format!("🛑 Failed to bind metrics server to {bind_address}: {e}").red()
        );
        Error::UserInput(format!("failed to bind metrics server: {e}"))
    })?;
    println!(
        "{}{}",
        "📈 Starting metrics server • addr=".green(),
        bind_address.green().dimmed(),
    );
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{}", format!("metrics server accept error: {e}").yellow());
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve(metrics.clone(), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("metrics connection error: {e}");
            }
        });
    }
}
