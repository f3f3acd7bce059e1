//! Prometheus metrics HTTP endpoint
//!
//! Exposes monitor metrics in Prometheus text format at /metrics, plus a
//! small control surface for the live session:
//! - `GET /metrics`, `GET /health`
//! - `POST /session/start` - show a placeholder session right away
//! - `POST /session/end` - dismiss the active session

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::orchestrator::MonitorCommand;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {}", avg * count);
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format a summary in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary) -> String {
    let mut output = String::with_capacity(4096);

    write_cycle_metrics(&mut output, summary);
    write_fetch_metrics(&mut output, summary);
    write_session_metrics(&mut output, summary);

    output
}

fn write_cycle_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_monitor_cycles_total",
        "Evaluation cycles completed",
        MetricType::Counter,
        summary.cycles_total,
    );
    write_metric(
        output,
        "crossing_monitor_cycles_skipped_total",
        "Cycles that ended without a publishable decision",
        MetricType::Counter,
        summary.cycles_skipped,
    );
    write_metric(
        output,
        "crossing_monitor_cycles_superseded_total",
        "Cycles discarded because a newer position arrived",
        MetricType::Counter,
        summary.cycles_superseded,
    );
    write_histogram(
        output,
        "crossing_monitor_cycle_latency_us",
        "Cycle latency in microseconds",
        &summary.cycle_latency_buckets,
        summary.avg_cycle_latency_us,
    );
    write_metric(
        output,
        "crossing_monitor_cycle_latency_p99_us",
        "99th percentile cycle latency",
        MetricType::Gauge,
        summary.cycle_p99_us,
    );
}

fn write_fetch_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_monitor_fetches_total",
        "Network fetches against the crossing service",
        MetricType::Counter,
        summary.fetches_total,
    );
    write_metric(
        output,
        "crossing_monitor_fetch_failures_total",
        "Fetches that failed (transient, decode, rate limited)",
        MetricType::Counter,
        summary.fetch_failures,
    );
    write_metric(
        output,
        "crossing_monitor_fetches_rate_limited_total",
        "Fetches answered with 429",
        MetricType::Counter,
        summary.fetches_rate_limited,
    );
    write_metric(
        output,
        "crossing_monitor_fetches_suspended_total",
        "Refreshes refused during a backoff window",
        MetricType::Counter,
        summary.fetches_suspended,
    );
    write_metric(
        output,
        "crossing_monitor_directory_size",
        "Crossings in the current directory snapshot",
        MetricType::Gauge,
        summary.directory_size,
    );
}

fn write_session_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_monitor_sessions_created_total",
        "Live sessions created",
        MetricType::Counter,
        summary.sessions_created,
    );
    write_metric(
        output,
        "crossing_monitor_sessions_updated_total",
        "In-place live session updates",
        MetricType::Counter,
        summary.sessions_updated,
    );
    write_metric(
        output,
        "crossing_monitor_sessions_ended_total",
        "Live sessions ended",
        MetricType::Counter,
        summary.sessions_ended,
    );
    write_metric(
        output,
        "crossing_monitor_publish_failures_total",
        "Host session calls that failed",
        MetricType::Counter,
        summary.publish_failures,
    );
    write_metric(
        output,
        "crossing_monitor_session_active",
        "1 while a live session is shown",
        MetricType::Gauge,
        summary.session_active as u64,
    );
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn submit_command(
    commands: &mpsc::Sender<MonitorCommand>,
    command: MonitorCommand,
) -> Response<Full<Bytes>> {
    let name = command.as_str();
    match commands.try_send(command) {
        Ok(()) => {
            info!(command = name, "manual_session_command");
            json_response(StatusCode::ACCEPTED, r#"{"ok":true}"#)
        }
        Err(e) => {
            warn!(command = name, error = %e, "manual_session_command_rejected");
            json_response(StatusCode::SERVICE_UNAVAILABLE, r#"{"ok":false,"error":"monitor_busy"}"#)
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    commands: mpsc::Sender<MonitorCommand>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics.report());
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        (&Method::POST, "/session/start") => {
            Ok(submit_command(&commands, MonitorCommand::StartNow))
        }
        (&Method::POST, "/session/end") => {
            Ok(submit_command(&commands, MonitorCommand::EndSession))
        }
        (&Method::OPTIONS, "/session/start" | "/session/end") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the metrics and control HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    commands: mpsc::Sender<MonitorCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let commands = commands.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let commands = commands.clone();
                                async move { handle_request(req, metrics, commands).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_cycle(800);
        metrics.record_cycle(30_000);
        metrics.record_fetch();
        metrics.set_directory_size(3);
        metrics.record_session_created();

        let output = format_prometheus_metrics(&metrics.report());

        assert!(output.contains("crossing_monitor_cycles_total 2"));
        assert!(output.contains("crossing_monitor_cycle_latency_us_bucket{le=\"1000\"} 1"));
        assert!(output.contains("crossing_monitor_cycle_latency_us_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("crossing_monitor_fetches_total 1"));
        assert!(output.contains("crossing_monitor_directory_size 3"));
        assert!(output.contains("crossing_monitor_session_active 1"));
    }

    #[tokio::test]
    async fn test_submit_command_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);

        let first = submit_command(&tx, MonitorCommand::StartNow);
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = submit_command(&tx, MonitorCommand::EndSession);
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        assert!(matches!(rx.recv().await, Some(MonitorCommand::StartNow)));
    }
}
