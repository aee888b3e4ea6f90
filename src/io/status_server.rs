//! Metrics and status HTTP endpoint
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /status` - JSON snapshot of the running tracking session
//! - `GET /health` - liveness check
//!
//! Uses hyper for the HTTP server. Reading metrics here never resets the
//! periodic reporting window.

use crate::domain::types::epoch_ms;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::supervisor::SessionStatus;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
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

/// Write a simple metric (counter or gauge) with agent label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, agent: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{agent=\"{agent}\"}} {val}");
}

/// Write a histogram for the current reporting window
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    agent: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{agent=\"{agent}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{agent=\"{agent}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{agent=\"{agent}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{agent=\"{agent}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, agent: &str) -> String {
    let mut output = String::with_capacity(4096);

    let counters: [(&str, &str, u64); 12] = [
        ("smartbus_samples_total", "Samples captured", summary.samples_total),
        ("smartbus_fixes_discarded_total", "Fixes without valid coordinates", summary.fixes_discarded_total),
        ("smartbus_sampler_events_dropped_total", "Sampler events dropped on a full queue", summary.sampler_events_dropped),
        ("smartbus_sensor_failures_total", "Location sensor failures", summary.sensor_failures_total),
        ("smartbus_sampler_restarts_total", "Automatic sampler restarts", summary.sampler_restarts_total),
        ("smartbus_durable_ok_total", "Location updates acknowledged by the backend", summary.durable_ok_total),
        ("smartbus_durable_failed_total", "Location updates that failed", summary.durable_failed_total),
        ("smartbus_live_pushed_total", "Messages published on the live channel", summary.live_pushed_total),
        ("smartbus_live_dropped_total", "Messages dropped by the live channel", summary.live_dropped_total),
        ("smartbus_live_connects_total", "Live channel connections established", summary.live_connects_total),
        ("smartbus_live_disconnects_total", "Live channel connections lost", summary.live_disconnects_total),
        ("smartbus_live_reconnect_attempts_total", "Live channel reconnection attempts", summary.live_reconnect_attempts_total),
    ];
    for (name, help, value) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, agent, value);
    }

    write_metric(
        &mut output,
        "smartbus_live_state",
        "Live channel state (0=disconnected, 1=connecting, 2=connected)",
        MetricType::Gauge,
        agent,
        summary.live_state,
    );
    write_histogram(
        &mut output,
        "smartbus_durable_latency_ms",
        "Durable request latency in milliseconds (current window)",
        agent,
        &summary.durable_lat_buckets,
        summary.durable_lat_avg_ms,
    );
    write_metric(
        &mut output,
        "smartbus_durable_latency_p95_ms",
        "95th percentile durable request latency (current window)",
        MetricType::Gauge,
        agent,
        summary.durable_lat_p95_ms,
    );

    output
}

#[derive(Serialize)]
struct StatusBody<'a> {
    agent: &'a str,
    #[serde(flatten)]
    session: &'a SessionStatus,
    elapsed: String,
}

fn format_status(agent: &str, status: &SessionStatus) -> String {
    let body = StatusBody {
        agent,
        session: status,
        elapsed: status.statistics.elapsed_hms(epoch_ms()),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string())
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    agent: Arc<String>,
    status: Option<watch::Receiver<SessionStatus>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics.snapshot(), &agent),
        ),
        (&Method::GET, "/status") => match status {
            Some(rx) => {
                let body = format_status(&agent, &rx.borrow());
                text_response(StatusCode::OK, "application/json", body)
            }
            None => text_response(
                StatusCode::NOT_FOUND,
                "application/json",
                r#"{"error":"no active session"}"#.to_string(),
            ),
        },
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    };
    Ok(response)
}

/// Serve until `shutdown` flips to true
pub async fn start_status_server(
    port: u16,
    metrics: Arc<Metrics>,
    agent_id: String,
    status: Option<watch::Receiver<SessionStatus>>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    serve(listener, metrics, agent_id, status, shutdown).await
}

async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    agent_id: String,
    status: Option<watch::Receiver<SessionStatus>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let agent = Arc::new(agent_id);
    info!(addr = %listener.local_addr()?, agent = %agent, "status_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let agent = agent.clone();
                        let status = status.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), agent.clone(), status.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "status_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "status_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("status_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ChannelConnectionState, SamplerState, SessionStatistics, TrackingIdentity};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn status() -> SessionStatus {
        SessionStatus {
            session_id: uuid::Uuid::now_v7(),
            identity: TrackingIdentity::new("D1", "B1"),
            connection: ChannelConnectionState::Connected,
            connection_id: Some("agent-1".to_string()),
            sampler: SamplerState::Active,
            statistics: SessionStatistics { sample_count: 3, last_update_ms: Some(1), started_at_ms: 0 },
            last_sample: None,
            tracking: true,
        }
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_sample();
        metrics.record_durable_delivery(true, 80);
        metrics.set_live_state(2);

        let output = format_prometheus_metrics(&metrics.snapshot(), "bus-17");
        assert!(output.contains("smartbus_samples_total{agent=\"bus-17\"} 1"));
        assert!(output.contains("smartbus_durable_ok_total{agent=\"bus-17\"} 1"));
        assert!(output.contains("smartbus_live_state{agent=\"bus-17\"} 2"));
        assert!(output.contains("smartbus_durable_latency_ms_bucket{agent=\"bus-17\",le=\"100\"} 1"));
        assert!(output.contains("smartbus_durable_latency_ms_count{agent=\"bus-17\"} 1"));
    }

    #[test]
    fn test_format_status_json() {
        let json: serde_json::Value = serde_json::from_str(&format_status("bus-17", &status())).unwrap();
        assert_eq!(json["agent"], "bus-17");
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["sampler"], "active");
        assert_eq!(json["statistics"]["sample_count"], 3);
        assert_eq!(json["identity"]["driver_id"], "D1");
        assert!(json["elapsed"].as_str().unwrap().contains(':'));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_metrics_and_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_status_tx, status_rx) = watch::channel(status());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(
            listener,
            Arc::new(Metrics::new()),
            "bus-17".to_string(),
            Some(status_rx),
            shutdown_rx,
        ));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("smartbus_samples_total"));

        let status = get(addr, "/status").await;
        assert!(status.contains("\"sample_count\":3"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
