//! Prometheus metrics for stackgate.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the HTTP RED middleware, and
//! exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "stackgate_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "stackgate_http_request_duration_seconds";

/// Backend commands executed (counter). Labels: command, outcome.
pub const BACKEND_COMMANDS_TOTAL: &str = "stackgate_backend_commands_total";

/// Backend command round-trip in seconds (histogram). Labels: command.
pub const BACKEND_COMMAND_DURATION_SECONDS: &str = "stackgate_backend_command_duration_seconds";

/// Login + key retrieval handshakes (counter). Labels: outcome.
pub const BACKEND_LOGINS_TOTAL: &str = "stackgate_backend_logins_total";

/// Session and token lookups (counter). Labels: scheme, result.
pub const SESSION_CACHE_TOTAL: &str = "stackgate_session_cache_total";

/// Async jobs that reached an end state (counter). Labels: outcome.
pub const JOBS_TOTAL: &str = "stackgate_jobs_total";

/// Cached backend sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "stackgate_sessions_active";

/// Issued bearer tokens not yet revoked or swept (gauge).
pub const TOKENS_ACTIVE: &str = "stackgate_tokens_active";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BACKEND_COMMANDS_TOTAL, "Total CloudStack API commands");
    describe_histogram!(
        BACKEND_COMMAND_DURATION_SECONDS,
        "CloudStack API command duration in seconds"
    );
    describe_counter!(BACKEND_LOGINS_TOTAL, "CloudStack login handshakes");
    describe_counter!(SESSION_CACHE_TOTAL, "Session and token cache lookups");
    describe_counter!(JOBS_TOTAL, "Async jobs by final outcome");
    describe_gauge!(SESSIONS_ACTIVE, "Cached backend sessions");
    describe_gauge!(TOKENS_ACTIVE, "Live bearer tokens");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize a request path for metric labels by replacing object ids with
/// `{id}`.
///
/// A segment counts as an id when it is all digits or contains a digit and
/// a `-` (CloudStack UUIDs).
///
/// Examples:
/// - `/ovirt-engine/api` -> `/ovirt-engine/api`
/// - `/ovirt-engine/api/vms/4c1f0f2e-...` -> `/ovirt-engine/api/vms/{id}`
/// - `/ovirt-engine/api/vms/42/disks` -> `/ovirt-engine/api/vms/{id}/disks`
fn normalize_path(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    path.split('/')
        .map(|segment| if looks_like_id(segment) { "{id}" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn looks_like_id(segment: &str) -> bool {
    let has_digit = segment.bytes().any(|b| b.is_ascii_digit());
    has_digit && (segment.bytes().all(|b| b.is_ascii_digit()) || segment.contains('-'))
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
