//! In-memory Table service emulator.
//!
//! The [`app`] function wires the Table REST surface (tables, entities,
//! queries and `$batch`) to an in-memory [`store::TableStore`] and returns a
//! ready-to-serve [`axum::Router`].  It speaks the same wire protocol as the
//! client, including two-layer multipart changesets, so it doubles as a
//! local test target.

pub mod error;
pub mod handlers;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::{any, get},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{canonical_resource, SharedKeyCredential};
use crate::config::EmulatorConfig;
use crate::errors::Result;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::request::API_VERSION;
use error::{generate_request_id, ServiceError};
use store::TableStore;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared emulator state passed to all handlers via `axum::extract::State`.
pub struct EmulatorState {
    pub config: EmulatorConfig,
    pub store: TableStore,
    credential: SharedKeyCredential,
}

impl EmulatorState {
    pub fn new(config: EmulatorConfig) -> Result<Self> {
        let credential = SharedKeyCredential::new(config.account.clone(), &config.account_key)?;
        Ok(Self {
            config,
            store: TableStore::new(),
            credential,
        })
    }
}

/// Build the emulator [`Router`].
pub fn app(state: Arc<EmulatorState>, metrics_enabled: bool) -> Router {
    let mut router = Router::new().route("/health", get(handlers::health_check));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .route("/:resource", any(handlers::handle_resource))
        .route("/:account/:resource", any(handlers::handle_resource))
        .with_state(state.clone())
        // auth_middleware is innermost (closest to handlers, after routing).
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    if metrics_enabled {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    }
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-ms-request-id`, `x-ms-version` and `Date` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // The error renderer sets its own request id.
    if !headers.contains_key("x-ms-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-ms-request-id", value);
        }
    }
    headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
        headers.insert("date", date);
    }

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics"];

/// Shared Key verification, enabled by `emulator.require_auth`.
async fn auth_middleware(
    State(state): State<Arc<EmulatorState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> std::result::Result<Response, ServiceError> {
    if state.config.require_auth && !AUTH_SKIP_PATHS.contains(&req.uri().path()) {
        verify_shared_key(&state, &req)?;
    }
    Ok(next.run(req).await)
}

/// Check the request's `Authorization: SharedKey` header against the
/// configured account key.
fn verify_shared_key(
    state: &EmulatorState,
    req: &Request<axum::body::Body>,
) -> std::result::Result<(), ServiceError> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    let authorization = header("authorization");
    if authorization.is_empty() {
        return Err(ServiceError::AuthenticationFailed {
            message: "Authorization header is missing.".to_string(),
        });
    }
    let date = match header("x-ms-date") {
        "" => header("date"),
        d => d,
    };
    let resource = canonical_resource(&state.config.account, req.uri().path(), req.uri().query());

    let valid = state.credential.verify(
        authorization,
        req.method().as_str(),
        header("content-md5"),
        header("content-type"),
        date,
        &resource,
    );
    if !valid {
        debug!("Shared Key signature mismatch for {}", resource);
        return Err(ServiceError::AuthenticationFailed {
            message: "The MAC signature found in the HTTP request is not the same as any computed signature.".to_string(),
        });
    }
    Ok(())
}
