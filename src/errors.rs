//! Client-side error types.
//!
//! Every failure the client can report is a [`TableError`] variant.  The
//! variants group into a handful of [`ErrorKind`]s so callers can tell a
//! local validation problem from a rejected transaction without matching
//! on every case.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TableError> = std::result::Result<T, E>;

/// Coarse classification of a [`TableError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected locally before any network call.
    Validation,
    /// Entity bytes or typed values could not be encoded or decoded.
    Encoding,
    /// The HTTP call failed below the application layer.
    Transport,
    /// The outer batch response was not an accepted multipart body.
    OuterProtocol,
    /// One of the operations inside a transaction failed.
    InnerOperation,
    /// A single-entity or table operation returned an error status.
    Service,
    /// Client construction or configuration failed.
    Setup,
}

/// Table client errors.
#[derive(Debug, Error)]
pub enum TableError {
    /// A transaction was submitted without any actions.
    #[error("transaction cannot be empty")]
    EmptyTransaction,

    /// An entity is missing one of its mandatory keys.
    #[error("entity is missing required property {key}{}", .index.map(|i| format!(" (action {i})")).unwrap_or_default())]
    MissingKey {
        key: &'static str,
        index: Option<usize>,
    },

    /// A caller-supplied argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Entity bytes are not a valid JSON object.
    #[error("invalid entity JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A property carrying an EDM annotation failed its typed decode.
    #[error("property {property} is not a valid {edm_type}: {message}")]
    EdmDecode {
        property: String,
        edm_type: String,
        message: String,
    },

    /// A value cannot be represented on the wire.
    #[error("{message}")]
    Encoding { message: String },

    /// The HTTP request could not be completed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The batch endpoint answered with something other than 202 / 204.
    #[error("unexpected status {status} from batch endpoint{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    UnexpectedStatus {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The service rejected the whole batch with a bare JSON error body.
    #[error("batch rejected{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    BatchRejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The batch response body could not be decoded.
    #[error("malformed batch response: {message}")]
    MalformedResponse { message: String },

    /// A raw HTTP request (a changeset part) could not be decoded.
    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    /// An operation inside the transaction failed and the service rolled back.
    #[error("transaction failed{} with status {status}{}: {message}",
        .index.map(|i| format!(" at action {i}")).unwrap_or_default(),
        .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    TransactionFailed {
        index: Option<usize>,
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// A single-entity or table operation returned an error status.
    #[error("service returned {status}{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Service {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Credentials could not be built or used.
    #[error("credential error: {message}")]
    Credential { message: String },

    /// Client configuration is incomplete or contradictory.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl TableError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TableError::EmptyTransaction
            | TableError::MissingKey { .. }
            | TableError::InvalidArgument { .. } => ErrorKind::Validation,
            TableError::Json(_)
            | TableError::EdmDecode { .. }
            | TableError::Encoding { .. }
            | TableError::MalformedRequest { .. } => ErrorKind::Encoding,
            TableError::Transport(_) => ErrorKind::Transport,
            TableError::UnexpectedStatus { .. }
            | TableError::BatchRejected { .. }
            | TableError::MalformedResponse { .. } => ErrorKind::OuterProtocol,
            TableError::TransactionFailed { .. } => ErrorKind::InnerOperation,
            TableError::Service { .. } => ErrorKind::Service,
            TableError::Credential { .. } | TableError::Config { .. } => ErrorKind::Setup,
        }
    }

    /// The service error code, when the service supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            TableError::UnexpectedStatus { code, .. }
            | TableError::BatchRejected { code, .. }
            | TableError::TransactionFailed { code, .. }
            | TableError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// The HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TableError::UnexpectedStatus { status, .. }
            | TableError::BatchRejected { status, .. }
            | TableError::TransactionFailed { status, .. }
            | TableError::Service { status, .. } => Some(*status),
            TableError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Build a [`TableError::Service`] from an error response body.
    pub(crate) fn from_service_body(status: u16, body: &[u8]) -> Self {
        let (code, message) = parse_odata_error(body);
        TableError::Service {
            status,
            code,
            message,
        }
    }
}

/// Extract `(code, message)` from an OData JSON error body.
///
/// Accepts both the `odata.error` (minimal metadata) and `error` shapes,
/// and falls back to the raw body text when it is not JSON.
pub(crate) fn parse_odata_error(body: &[u8]) -> (Option<String>, String) {
    let fallback = || String::from_utf8_lossy(body).trim().to_string();
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return (None, fallback()),
    };
    let err = value.get("odata.error").or_else(|| value.get("error"));
    let Some(err) = err else {
        return (None, fallback());
    };
    let code = err
        .get("code")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let message = match err.get("message") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(m) => m
            .get("value")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(fallback),
        None => fallback(),
    };
    (code, message)
}
