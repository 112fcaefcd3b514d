//! Entity request construction shared by single-entity calls and changesets.
//!
//! | action          | method | resource      | If-Match                 |
//! |-----------------|--------|---------------|--------------------------|
//! | Add             | POST   | `/{table}`    | never                    |
//! | Delete          | DELETE | keyed entity  | supplied token, else `*` |
//! | Update/InsertMerge   | PATCH  | keyed entity | only when supplied |
//! | Update/InsertReplace | PUT    | keyed entity | only when supplied |
//!
//! Cosmos endpoints get `POST` + `X-HTTP-Method: MERGE` instead of `PATCH`.

use http::Method;
use serde_json::Value;

use crate::endpoint::{entity_path, is_cosmos_endpoint, split_root, table_path};
use crate::entity::{PARTITION_KEY, ROW_KEY};
use crate::errors::{Result, TableError};
use crate::transaction::ActionType;
use crate::wire::RawRequest;

/// Table service REST API version.
pub const API_VERSION: &str = "2019-02-02";

/// OData protocol version sent with every request.
pub const DATA_SERVICE_VERSION: &str = "3.0";

/// Accept header requesting minimal OData metadata.
pub const ACCEPT_MINIMAL_METADATA: &str = "application/json;odata=minimalmetadata";

/// Wildcard ETag matching any existing entity.
pub const MATCH_ANY: &str = "*";

/// Where entity requests for one table are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Service root without trailing slash or query string.
    pub root: String,
    pub table: String,
    /// Rewrite `PATCH` merges for the Cosmos Table API.
    pub cosmos: bool,
}

impl RequestTarget {
    pub fn new(root: &str, table: impl Into<String>) -> Self {
        let (base, _) = split_root(root);
        Self {
            root: base.to_string(),
            table: table.into(),
            cosmos: is_cosmos_endpoint(base),
        }
    }

    pub fn collection_url(&self) -> String {
        format!("{}{}", self.root, table_path(&self.table))
    }

    pub fn entity_url(&self, partition_key: &str, row_key: &str) -> String {
        format!(
            "{}{}",
            self.root,
            entity_path(&self.table, partition_key, row_key)
        )
    }
}

/// Extract `(PartitionKey, RowKey)` from entity JSON.
pub fn entity_keys(entity: &[u8]) -> Result<(String, String)> {
    let value: Value = serde_json::from_slice(entity)?;
    let Value::Object(map) = value else {
        return Err(TableError::Encoding {
            message: "entity must be a JSON object".to_string(),
        });
    };
    let key = |name: &'static str| {
        map.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(TableError::MissingKey { key: name, index: None })
    };
    Ok((key(PARTITION_KEY)?, key(ROW_KEY)?))
}

/// Headers every entity request carries.
pub(crate) fn base_request(method: Method, url: String) -> RawRequest {
    let mut req = RawRequest::new(method, url);
    req.set_header("Accept", ACCEPT_MINIMAL_METADATA);
    req.set_header("DataServiceVersion", DATA_SERVICE_VERSION);
    req.set_header("x-ms-version", API_VERSION);
    req
}

fn attach_json_body(req: &mut RawRequest, entity: &[u8]) {
    req.set_header("Content-Type", "application/json");
    req.set_header("Content-Length", entity.len().to_string());
    req.body = Some(bytes::Bytes::copy_from_slice(entity));
}

/// Build the request for one entity mutation.
pub fn build_entity_request(
    target: &RequestTarget,
    action_type: ActionType,
    entity: &[u8],
    if_match: Option<&str>,
) -> Result<RawRequest> {
    let (partition_key, row_key) = entity_keys(entity)?;

    let mut req = match action_type {
        ActionType::Add => {
            let mut req = base_request(Method::POST, target.collection_url());
            req.set_header("Prefer", "return-no-content");
            attach_json_body(&mut req, entity);
            req
        }
        ActionType::Delete => {
            let mut req = base_request(Method::DELETE, target.entity_url(&partition_key, &row_key));
            req.set_header("If-Match", if_match.unwrap_or(MATCH_ANY));
            req
        }
        ActionType::UpdateMerge | ActionType::InsertMerge => {
            let mut req = base_request(Method::PATCH, target.entity_url(&partition_key, &row_key));
            attach_json_body(&mut req, entity);
            req
        }
        ActionType::UpdateReplace | ActionType::InsertReplace => {
            let mut req = base_request(Method::PUT, target.entity_url(&partition_key, &row_key));
            attach_json_body(&mut req, entity);
            req
        }
    };

    if action_type != ActionType::Delete && action_type != ActionType::Add {
        if let Some(etag) = if_match {
            req.set_header("If-Match", etag);
        }
    }

    if target.cosmos && req.method == Method::PATCH {
        req.method = Method::POST;
        req.set_header("X-HTTP-Method", "MERGE");
    }

    Ok(req)
}

/// Build a GET for one entity.
pub fn build_get_request(target: &RequestTarget, partition_key: &str, row_key: &str) -> RawRequest {
    base_request(Method::GET, target.entity_url(partition_key, row_key))
}
