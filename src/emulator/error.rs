//! Table service error codes as returned by the emulator.
//!
//! Errors render as OData JSON:
//!
//! ```json
//! {"odata.error":{"code":"EntityAlreadyExists","message":{"lang":"en-US","value":"..."}}}
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::request::API_VERSION;

/// Generate an `x-ms-request-id` value.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("The table specified does not exist.")]
    TableNotFound,

    #[error("The table specified already exists.")]
    TableAlreadyExists,

    #[error("The specified resource does not exist.")]
    ResourceNotFound,

    #[error("The specified entity already exists.")]
    EntityAlreadyExists,

    #[error("The update condition specified in the request was not satisfied.")]
    UpdateConditionNotSatisfied,

    #[error("The batch request contains multiple changes with same row key. An entity can appear only once in a batch request.")]
    InvalidDuplicateRow,

    #[error("All commands in a batch must operate on same entity group.")]
    CommandsInBatchActOnDifferentPartitions,

    #[error("The batch request operation exceeds the maximum {max} changes per change set.")]
    TooManyOperations { max: usize },

    #[error("The specifed resource name contains invalid characters.")]
    InvalidResourceName,

    #[error("{message}")]
    InvalidInput { message: String },

    #[error("XML specified is not syntactically valid. {message}")]
    InvalidXmlDocument { message: String },

    #[error("Server failed to authenticate the request. {message}")]
    AuthenticationFailed { message: String },

    #[error("{message}")]
    NotImplemented { message: String },

    #[error("The HTTP verb specified is not supported.")]
    UnsupportedHttpVerb,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::TableNotFound => "TableNotFound",
            ServiceError::TableAlreadyExists => "TableAlreadyExists",
            ServiceError::ResourceNotFound => "ResourceNotFound",
            ServiceError::EntityAlreadyExists => "EntityAlreadyExists",
            ServiceError::UpdateConditionNotSatisfied => "UpdateConditionNotSatisfied",
            ServiceError::InvalidDuplicateRow => "InvalidDuplicateRow",
            ServiceError::CommandsInBatchActOnDifferentPartitions => {
                "CommandsInBatchActOnDifferentPartitions"
            }
            ServiceError::TooManyOperations { .. } => "InvalidInput",
            ServiceError::InvalidResourceName => "InvalidResourceName",
            ServiceError::InvalidInput { .. } => "InvalidInput",
            ServiceError::InvalidXmlDocument { .. } => "InvalidXmlDocument",
            ServiceError::AuthenticationFailed { .. } => "AuthenticationFailed",
            ServiceError::NotImplemented { .. } => "NotImplemented",
            ServiceError::UnsupportedHttpVerb => "UnsupportedHttpVerb",
            ServiceError::Internal(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::TableNotFound | ServiceError::ResourceNotFound => StatusCode::NOT_FOUND,
            ServiceError::TableAlreadyExists | ServiceError::EntityAlreadyExists => {
                StatusCode::CONFLICT
            }
            ServiceError::UpdateConditionNotSatisfied => StatusCode::PRECONDITION_FAILED,
            ServiceError::InvalidDuplicateRow
            | ServiceError::CommandsInBatchActOnDifferentPartitions
            | ServiceError::TooManyOperations { .. }
            | ServiceError::InvalidResourceName
            | ServiceError::InvalidInput { .. }
            | ServiceError::InvalidXmlDocument { .. } => StatusCode::BAD_REQUEST,
            ServiceError::AuthenticationFailed { .. } => StatusCode::FORBIDDEN,
            ServiceError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            ServiceError::UnsupportedHttpVerb => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OData JSON error body.  Inside a changeset the message is prefixed
    /// with the index of the failing operation.
    pub fn odata_body(&self, index: Option<usize>) -> String {
        let message = match index {
            Some(i) => format!("{i}:{self}"),
            None => self.to_string(),
        };
        json!({
            "odata.error": {
                "code": self.code(),
                "message": { "lang": "en-US", "value": message },
            }
        })
        .to_string()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        (
            self.status_code(),
            [
                (
                    "content-type",
                    "application/json;odata=minimalmetadata;streaming=true;charset=utf-8".to_string(),
                ),
                ("x-ms-request-id", request_id),
                ("x-ms-version", API_VERSION.to_string()),
                ("x-ms-error-code", self.code().to_string()),
                ("date", date),
            ],
            self.odata_body(None),
        )
            .into_response()
    }
}
