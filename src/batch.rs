//! Entity-group transactions over the OData `$batch` protocol.
//!
//! Request layout (two nested `multipart/mixed` bodies):
//!
//! ```text
//! --batch_{uuid}
//! Content-Type: multipart/mixed; boundary=changeset_{uuid}
//!
//! --changeset_{uuid}
//! Content-Transfer-Encoding: binary
//! Content-Type: application/http
//!
//! POST https://acct.table.core.windows.net/people HTTP/1.1
//! Accept: application/json;odata=minimalmetadata
//! ...
//!
//! {"PartitionKey":"p","RowKey":"1"}
//! --changeset_{uuid}--
//! --batch_{uuid}--
//! ```
//!
//! The response mirrors that shape with one `application/http` part per
//! operation.  A failed transaction still arrives as 202 Accepted; the
//! failure lives in an inner part whose error message is prefixed with the
//! index of the offending operation (`"1:The specified entity already exists."`).

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{parse_odata_error, Result, TableError};
use crate::multipart::{self, MultipartReader, MultipartWriter};
use crate::request::{build_entity_request, entity_keys, RequestTarget};
use crate::transaction::TransactionAction;
use crate::wire;

/// Prefix of the outer envelope boundary.
pub const BATCH_BOUNDARY_PREFIX: &str = "batch_";

/// Prefix of the changeset boundary.
pub const CHANGESET_BOUNDARY_PREFIX: &str = "changeset_";

/// Maximum number of operations the service accepts in one transaction.
pub const MAX_TRANSACTION_OPERATIONS: usize = 100;

/// Generate a fresh boundary token.
pub fn new_boundary(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4())
}

/// Attach the action index to a per-action validation error.
fn at_index(err: TableError, index: usize) -> TableError {
    match err {
        TableError::MissingKey { key, .. } => TableError::MissingKey {
            key,
            index: Some(index),
        },
        TableError::Json(e) => TableError::Encoding {
            message: format!("action {index}: invalid entity JSON: {e}"),
        },
        TableError::Encoding { message } => TableError::Encoding {
            message: format!("action {index}: {message}"),
        },
        other => other,
    }
}

/// Check the transaction-wide constraints that can be verified locally.
fn validate_actions(actions: &[TransactionAction]) -> Result<()> {
    if actions.is_empty() {
        return Err(TableError::EmptyTransaction);
    }
    if actions.len() > MAX_TRANSACTION_OPERATIONS {
        return Err(TableError::InvalidArgument {
            message: format!(
                "transaction has {} actions; at most {} are allowed",
                actions.len(),
                MAX_TRANSACTION_OPERATIONS
            ),
        });
    }
    let mut partition: Option<String> = None;
    for (index, action) in actions.iter().enumerate() {
        let (pk, _) = entity_keys(&action.entity).map_err(|e| at_index(e, index))?;
        if let Some(first) = &partition {
            if *first != pk {
                return Err(TableError::InvalidArgument {
                    message: format!(
                        "action {index} targets partition {pk:?} but the transaction is scoped to {first:?}"
                    ),
                });
            }
        } else {
            partition = Some(pk);
        }
    }
    Ok(())
}

/// Encode `actions` as a changeset body delimited by `boundary`.
pub fn encode_changeset(
    actions: &[TransactionAction],
    boundary: &str,
    target: &RequestTarget,
) -> Result<Vec<u8>> {
    validate_actions(actions)?;

    let mut writer = MultipartWriter::new(boundary);
    for (index, action) in actions.iter().enumerate() {
        let req = build_entity_request(
            target,
            action.action_type,
            &action.entity,
            action.if_match.as_deref(),
        )
        .map_err(|e| at_index(e, index))?;
        writer.write_part(
            &[
                ("Content-Type", "application/http"),
                ("Content-Transfer-Encoding", "binary"),
            ],
            &req.render(),
        );
    }
    Ok(writer.finish())
}

/// A fully encoded `$batch` request body.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_boundary: String,
    pub changeset_boundary: String,
    pub body: Vec<u8>,
}

impl BatchRequest {
    /// `Content-Type` for the outer request.
    pub fn content_type(&self) -> String {
        multipart::content_type(&self.batch_boundary)
    }
}

/// Encode a transaction with freshly generated boundaries.
pub fn build_batch(actions: &[TransactionAction], target: &RequestTarget) -> Result<BatchRequest> {
    build_batch_with_boundaries(
        actions,
        target,
        &new_boundary(BATCH_BOUNDARY_PREFIX),
        &new_boundary(CHANGESET_BOUNDARY_PREFIX),
    )
}

/// Encode a transaction with caller-chosen boundaries.
pub fn build_batch_with_boundaries(
    actions: &[TransactionAction],
    target: &RequestTarget,
    batch_boundary: &str,
    changeset_boundary: &str,
) -> Result<BatchRequest> {
    let changeset = encode_changeset(actions, changeset_boundary, target)?;

    let mut envelope = MultipartWriter::new(batch_boundary);
    let changeset_type = multipart::content_type(changeset_boundary);
    envelope.write_part(&[("Content-Type", changeset_type.as_str())], &changeset);

    Ok(BatchRequest {
        batch_boundary: batch_boundary.to_string(),
        changeset_boundary: changeset_boundary.to_string(),
        body: envelope.finish(),
    })
}

// -- Response -----------------------------------------------------------------

/// One operation's response inside a transaction.
#[derive(Debug, Clone)]
pub struct SubResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SubResponse {
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").and_then(|v| v.to_str().ok())
    }
}

/// The decoded result of a successful transaction.
#[derive(Debug, Clone)]
pub struct TransactionResponse {
    /// Status of the outer `$batch` response.
    pub status: StatusCode,
    /// Per-operation responses, in submission order.
    pub sub_responses: Vec<SubResponse>,
}

/// Whether an outer status signals that the batch was accepted.
pub fn is_accepted(status: StatusCode) -> bool {
    status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT
}

/// Read the operation index from an error message like `"2:Conflict"`.
pub fn failed_index(message: &str) -> Option<usize> {
    let (prefix, _) = message.split_once(':')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

fn malformed(message: impl Into<String>) -> TableError {
    TableError::MalformedResponse {
        message: message.into(),
    }
}

/// Decode an outer `$batch` response.
///
/// `action_count` is the number of submitted operations; it is used to
/// attribute a failure to an operation when the service does not say which
/// one failed.
pub fn parse_transaction_response(
    status: StatusCode,
    body: Bytes,
    action_count: usize,
) -> Result<TransactionResponse> {
    if !is_accepted(status) {
        let (code, message) = parse_odata_error(&body);
        return Err(TableError::UnexpectedStatus {
            status: status.as_u16(),
            code,
            message,
        });
    }

    let first = body.iter().copied().find(|b| !b.is_ascii_whitespace());
    match first {
        None => {
            debug!(%status, "batch response has no body");
            return Ok(TransactionResponse {
                status,
                sub_responses: Vec::new(),
            });
        }
        Some(b'{') => {
            let (code, message) = parse_odata_error(&body);
            return Err(TableError::BatchRejected {
                status: status.as_u16(),
                code,
                message,
            });
        }
        Some(_) => {}
    }

    let outer_boundary =
        multipart::sniff_boundary(&body).ok_or_else(|| malformed("missing batch boundary"))?;
    let changeset_part = MultipartReader::new(body, &outer_boundary)
        .next()
        .ok_or_else(|| malformed("batch response contains no parts"))??;

    let inner_boundary = multipart::sniff_boundary(&changeset_part.body)
        .or_else(|| changeset_part.boundary())
        .ok_or_else(|| malformed("missing changeset boundary"))?;

    let mut sub_responses = Vec::with_capacity(action_count);
    for (position, part) in MultipartReader::new(changeset_part.body.clone(), &inner_boundary).enumerate() {
        let part = part?;
        let (parts, body) = wire::parse_response(&part.body)?.into_parts();
        let sub = SubResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        };

        if sub.status.as_u16() >= 400 {
            let (code, message) = parse_odata_error(&sub.body);
            let index = failed_index(&message).or_else(|| {
                // A lone failure part carries no positional meaning.
                (action_count > 0 && position < action_count && (position > 0 || action_count == 1))
                    .then_some(position)
            });
            debug!(status = %sub.status, ?index, ?code, "transaction operation failed");
            return Err(TableError::TransactionFailed {
                index,
                status: sub.status.as_u16(),
                code,
                message,
            });
        }
        sub_responses.push(sub);
    }

    if sub_responses.len() != action_count {
        warn!(
            expected = action_count,
            received = sub_responses.len(),
            "transaction response count does not match submitted actions"
        );
    }

    Ok(TransactionResponse {
        status,
        sub_responses,
    })
}
