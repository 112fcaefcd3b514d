//! Prometheus metrics for the table emulator.
//!
//! The recorder is global and installed at most once; the emulator router
//! only mounts `/metrics` and the request middleware when it succeeded.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

// -- Names --------------------------------------------------------------------

/// Counter. Labels: method, path (normalized), status.
pub const HTTP_REQUESTS_TOTAL: &str = "aztables_http_requests_total";

/// Histogram of request latency. Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "aztables_http_request_duration_seconds";

/// Entity group transactions processed (counter). Labels: outcome.
pub const BATCHES_TOTAL: &str = "aztables_batches_total";

/// Operations committed through entity group transactions (counter).
pub const BATCH_OPERATIONS_TOTAL: &str = "aztables_batch_operations_total";

/// Tables currently held by the emulator (gauge).
pub const TABLES_TOTAL: &str = "aztables_tables_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent; the outcome of the
/// first attempt is cached. Returns `None` when another recorder already
/// owns the global slot.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        })
        .as_ref()
}

/// Register metric descriptions. Call once after `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BATCHES_TOTAL, "Entity group transactions by outcome");
    describe_counter!(
        BATCH_OPERATIONS_TOTAL,
        "Operations committed through entity group transactions"
    );
    describe_gauge!(TABLES_TOTAL, "Total tables");
}

// -- Metrics middleware -------------------------------------------------------

/// Records request count and latency for every request except `/metrics`.
/// Must be the outermost layer.
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

/// Map a request path to a route template so table names and keys do not
/// become label values.
///
/// - `/Tables`, `/Tables('t')` -> `/Tables`
/// - `/$batch` -> `/$batch`
/// - `/people`, `/people()` -> `/{table}`
/// - `/people(PartitionKey='p',RowKey='r')` -> `/{table}({keys})`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" => return path.to_string(),
        _ => {}
    }
    let trimmed = path.trim_start_matches('/');
    // Path-style addressing puts the account name first.
    let resource = match trimmed.split_once('/') {
        Some((account, rest)) if !account.contains('(') => rest,
        _ => trimmed,
    };
    let name = resource.split('(').next().unwrap_or_default();
    if name == "$batch" {
        return "/$batch".to_string();
    }
    if name.eq_ignore_ascii_case("Tables") {
        return "/Tables".to_string();
    }
    match resource.find('(') {
        Some(open) if !resource[open..].starts_with("()") => "/{table}({keys})".to_string(),
        _ => "/{table}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics`: Prometheus exposition format.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get().and_then(Option::as_ref) {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
