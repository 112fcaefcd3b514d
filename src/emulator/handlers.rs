//! Request handlers for the emulator.
//!
//! The Table service addresses everything through one path segment
//! (optionally preceded by the account name), so a single handler classifies
//! the resource and dispatches on method:
//!
//!   `Tables`                                  GET list, POST create
//!   `Tables('name')`                          DELETE
//!   `$batch`                                  POST entity-group transaction
//!   `{table}` / `{table}()`                   GET query, POST insert
//!   `{table}?comp=acl`                        GET, PUT stored access policies
//!   `{table}(PartitionKey='..',RowKey='..')`  GET, PUT, PATCH, MERGE, DELETE
//!
//! `POST` with `X-HTTP-Method` is treated as the named method.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use metrics::{counter, gauge};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::error::ServiceError;
use super::store::{EntityOp, OpResult};
use super::EmulatorState;
use crate::acl::{
    decode_signed_identifiers, encode_signed_identifiers, ACL_CONTENT_TYPE, MAX_SIGNED_IDENTIFIERS,
};
use crate::endpoint::parse_key_predicate;
use crate::entity::{unescape_key, PARTITION_KEY, ROW_KEY};
use crate::metrics::{BATCHES_TOTAL, BATCH_OPERATIONS_TOTAL, TABLES_TOTAL};
use crate::multipart::{self, MultipartReader, MultipartWriter};
use crate::request::DATA_SERVICE_VERSION;
use crate::wire::{self, RawRequest};

/// Content type of JSON responses.
const JSON_CONTENT_TYPE: &str = "application/json;odata=minimalmetadata;streaming=true;charset=utf-8";

/// Largest page a query returns.
const MAX_PAGE_SIZE: usize = 1000;

// -- Resource classification --------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Tables,
    Table(String),
    Batch,
    Collection(String),
    Entity {
        table: String,
        partition_key: String,
        row_key: String,
    },
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidInput {
        message: message.into(),
    }
}

/// Classify a request path (still percent-encoded). Path-style addressing
/// (`/{account}/Tables`) is accepted by dropping the leading segment.
fn parse_resource(path: &str) -> Result<Resource, ServiceError> {
    let raw = path.trim_start_matches('/');
    let raw = match raw.split_once('/') {
        Some((account, rest)) if !account.contains('(') => rest,
        _ => raw,
    };
    let decoded = percent_encoding::percent_decode_str(raw).decode_utf8_lossy();
    let decoded = decoded.as_ref();

    if decoded == "Tables" || decoded == "Tables()" {
        return Ok(Resource::Tables);
    }
    if let Some(name) = decoded
        .strip_prefix("Tables('")
        .and_then(|rest| rest.strip_suffix("')"))
    {
        return Ok(Resource::Table(unescape_key(name)));
    }
    if decoded == "$batch" {
        return Ok(Resource::Batch);
    }

    let Some(open) = decoded.find('(') else {
        return Ok(Resource::Collection(decoded.to_string()));
    };
    let (table, predicate) = decoded.split_at(open);
    if predicate == "()" {
        return Ok(Resource::Collection(table.to_string()));
    }
    let (partition_key, row_key) = parse_key_predicate(predicate)
        .ok_or_else(|| invalid(format!("invalid key predicate: {predicate}")))?;
    Ok(Resource::Entity {
        table: table.to_string(),
        partition_key,
        row_key,
    })
}

/// Table names: a letter followed by 2-62 alphanumerics.
fn validate_table_name(name: &str) -> Result<(), ServiceError> {
    let valid = (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidResourceName)
    }
}

/// The method a request stands for, honoring `X-HTTP-Method` tunnelling.
fn effective_method(method: &Method, tunnelled: Option<&str>) -> Result<Method, ServiceError> {
    match tunnelled {
        Some(name) if *method == Method::POST => {
            Method::from_bytes(name.trim().as_bytes()).map_err(|_| ServiceError::UnsupportedHttpVerb)
        }
        _ => Ok(method.clone()),
    }
}

// -- Query parameter parsing helper --------------------------------------------

/// Parse a raw query string into a map (form-style: `+` is a space).
fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(&s.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    };
    let mut map = HashMap::new();
    for part in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((k, v)) => map.insert(decode(k), decode(v)),
            None => map.insert(decode(part), String::new()),
        };
    }
    map
}

/// Accept only `PartitionKey eq '<value>'`.
fn parse_partition_filter(filter: &str) -> Result<String, ServiceError> {
    let filter = filter.trim();
    let value = filter
        .strip_prefix("PartitionKey eq '")
        .and_then(|rest| rest.strip_suffix('\''))
        .filter(|v| !v.replace("''", "").contains('\''))
        .ok_or_else(|| ServiceError::NotImplemented {
            message: format!("filter expression not supported: {filter}"),
        })?;
    Ok(unescape_key(value))
}

fn parse_top(query: &HashMap<String, String>) -> Result<usize, ServiceError> {
    match query.get("$top") {
        None => Ok(MAX_PAGE_SIZE),
        Some(v) => match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n.min(MAX_PAGE_SIZE)),
            _ => Err(invalid(format!("invalid $top value: {v}"))),
        },
    }
}

// -- Entity bodies -------------------------------------------------------------

/// Parse an entity body, dropping OData metadata and `Timestamp`.
fn parse_entity_body(body: &[u8]) -> Result<Map<String, Value>, ServiceError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| invalid(format!("invalid entity JSON: {e}")))?;
    let Value::Object(map) = value else {
        return Err(invalid("entity body must be a JSON object"));
    };
    let mut properties = Map::with_capacity(map.len());
    for (name, value) in map {
        if name.starts_with("odata.") || name == "Timestamp" || name == "Timestamp@odata.type" {
            continue;
        }
        if value.is_object() || value.is_array() {
            return Err(invalid(format!("property {name} has an unsupported value")));
        }
        properties.insert(name, value);
    }
    Ok(properties)
}

fn require_string_key(properties: &Map<String, Value>, key: &str) -> Result<(), ServiceError> {
    match properties.get(key) {
        Some(Value::String(_)) => Ok(()),
        _ => Err(invalid(format!("{key} must be a string property"))),
    }
}

/// Translate one entity request into a store operation.
///
/// Shared by direct requests and changeset parts.
fn build_op(
    method: &Method,
    resource: Resource,
    if_match: Option<&str>,
    body: &[u8],
) -> Result<(String, EntityOp), ServiceError> {
    match (resource, method.as_str()) {
        (Resource::Collection(table), "POST") => {
            let properties = parse_entity_body(body)?;
            require_string_key(&properties, PARTITION_KEY)?;
            require_string_key(&properties, ROW_KEY)?;
            Ok((table, EntityOp::Insert { properties }))
        }
        (
            Resource::Entity {
                table,
                partition_key,
                row_key,
            },
            verb @ ("PUT" | "PATCH" | "MERGE"),
        ) => {
            let mut properties = parse_entity_body(body)?;
            properties.insert(PARTITION_KEY.to_string(), Value::String(partition_key));
            properties.insert(ROW_KEY.to_string(), Value::String(row_key));
            Ok((
                table,
                EntityOp::Update {
                    properties,
                    merge: verb != "PUT",
                    if_match: if_match.map(str::to_string),
                },
            ))
        }
        (
            Resource::Entity {
                table,
                partition_key,
                row_key,
            },
            "DELETE",
        ) => {
            let if_match = if_match.ok_or_else(|| invalid("If-Match header is required for delete"))?;
            Ok((
                table,
                EntityOp::Delete {
                    partition_key,
                    row_key,
                    if_match: if_match.to_string(),
                },
            ))
        }
        _ => Err(ServiceError::UnsupportedHttpVerb),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn prefers_no_content(prefer: Option<&str>) -> bool {
    prefer.is_some_and(|p| p.trim().eq_ignore_ascii_case("return-no-content"))
}

fn json_response(status: StatusCode, extra: Vec<(&'static str, String)>, body: Value) -> Response {
    let mut resp = (status, [("content-type", JSON_CONTENT_TYPE)], body.to_string()).into_response();
    for (name, value) in extra {
        if let Ok(value) = value.parse() {
            resp.headers_mut().insert(name, value);
        }
    }
    resp
}

fn no_content(etag: Option<&str>) -> Response {
    let mut resp = StatusCode::NO_CONTENT.into_response();
    if let Some(value) = etag.and_then(|e| e.parse().ok()) {
        resp.headers_mut().insert("etag", value);
    }
    resp
}

// -- Dispatch ------------------------------------------------------------------

/// Entry point for every Table service path.
pub async fn handle_resource(
    State(state): State<Arc<EmulatorState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let resource = parse_resource(uri.path())?;
    let method = effective_method(&method, header(&headers, "x-http-method"))?;
    let query = parse_query(uri.query());
    debug!(%method, ?resource, "table request");

    let acl = query.get("comp").is_some_and(|c| c == "acl");

    match (&resource, method.as_str()) {
        (Resource::Collection(table), "GET") if acl => get_access_policy(&state, table),
        (Resource::Collection(table), "PUT") if acl => set_access_policy(&state, table, &body),
        (Resource::Tables, "GET") => list_tables(&state, &query),
        (Resource::Tables, "POST") => create_table(&state, &headers, &body),
        (Resource::Table(name), "DELETE") => delete_table(&state, name),
        (Resource::Batch, "POST") => submit_batch(&state, &headers, body),
        (Resource::Collection(table), "GET") => query_entities(&state, table, &query),
        (Resource::Entity { table, partition_key, row_key }, "GET") => {
            get_entity(&state, table, partition_key, row_key)
        }
        (Resource::Collection(_) | Resource::Entity { .. }, _) => {
            let prefer = header(&headers, "prefer");
            let (table, op) = build_op(&method, resource.clone(), header(&headers, "if-match"), &body)?;
            write_entity(&state, &table, op, prefers_no_content(prefer))
        }
        _ => Err(ServiceError::UnsupportedHttpVerb),
    }
}

// -- Tables --------------------------------------------------------------------

fn list_tables(
    state: &EmulatorState,
    query: &HashMap<String, String>,
) -> Result<Response, ServiceError> {
    let top = parse_top(query)?;
    let (names, next) = state
        .store
        .list_tables(query.get("NextTableName").map(String::as_str), top)?;
    let value: Vec<Value> = names.iter().map(|n| json!({ "TableName": n })).collect();
    let extra = next
        .map(|n| vec![("x-ms-continuation-nexttablename", n)])
        .unwrap_or_default();
    Ok(json_response(StatusCode::OK, extra, json!({ "value": value })))
}

fn create_table(
    state: &EmulatorState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ServiceError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| invalid(format!("invalid table JSON: {e}")))?;
    let name = value
        .get("TableName")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("TableName is required"))?;
    validate_table_name(name)?;
    state.store.create_table(name)?;
    gauge!(TABLES_TOTAL).set(state.store.table_count() as f64);
    info!("Created table {}", name);

    if prefers_no_content(header(headers, "prefer")) {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        resp.headers_mut().insert(
            "preference-applied",
            axum::http::HeaderValue::from_static("return-no-content"),
        );
        return Ok(resp);
    }
    Ok(json_response(
        StatusCode::CREATED,
        Vec::new(),
        json!({ "TableName": name }),
    ))
}

fn delete_table(state: &EmulatorState, name: &str) -> Result<Response, ServiceError> {
    state.store.delete_table(name)?;
    gauge!(TABLES_TOTAL).set(state.store.table_count() as f64);
    info!("Deleted table {}", name);
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn get_access_policy(state: &EmulatorState, table: &str) -> Result<Response, ServiceError> {
    let policies = state.store.access_policies(table)?;
    let body = encode_signed_identifiers(&policies)
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok((StatusCode::OK, [("content-type", ACL_CONTENT_TYPE)], body).into_response())
}

fn set_access_policy(
    state: &EmulatorState,
    table: &str,
    body: &[u8],
) -> Result<Response, ServiceError> {
    let policies = decode_signed_identifiers(body).map_err(|e| ServiceError::InvalidXmlDocument {
        message: e.to_string(),
    })?;
    if policies.len() > MAX_SIGNED_IDENTIFIERS {
        return Err(ServiceError::InvalidXmlDocument {
            message: format!("at most {MAX_SIGNED_IDENTIFIERS} signed identifiers are allowed"),
        });
    }
    debug!(table, policies = policies.len(), "setting access policies");
    state.store.set_access_policies(table, policies)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Entities ------------------------------------------------------------------

fn query_entities(
    state: &EmulatorState,
    table: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ServiceError> {
    let partition = query
        .get("$filter")
        .map(|f| parse_partition_filter(f))
        .transpose()?;
    let top = parse_top(query)?;
    let from = query.get("NextPartitionKey").map(|pk| {
        (
            pk.clone(),
            query.get("NextRowKey").cloned().unwrap_or_default(),
        )
    });
    let select: Option<Vec<String>> = query.get("$select").map(|s| {
        s.split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    });

    let page = state.store.query(table, partition.as_deref(), from, top)?;
    let value: Vec<Value> = page
        .entities
        .iter()
        .map(|e| e.to_json(select.as_deref()))
        .collect();
    let extra = page
        .continuation
        .map(|(pk, rk)| {
            vec![
                ("x-ms-continuation-nextpartitionkey", pk),
                ("x-ms-continuation-nextrowkey", rk),
            ]
        })
        .unwrap_or_default();
    Ok(json_response(StatusCode::OK, extra, json!({ "value": value })))
}

fn get_entity(
    state: &EmulatorState,
    table: &str,
    partition_key: &str,
    row_key: &str,
) -> Result<Response, ServiceError> {
    let entity = state.store.get_entity(table, partition_key, row_key)?;
    Ok(json_response(
        StatusCode::OK,
        vec![("etag", entity.etag.clone())],
        entity.to_json(None),
    ))
}

fn write_entity(
    state: &EmulatorState,
    table: &str,
    op: EntityOp,
    no_content: bool,
) -> Result<Response, ServiceError> {
    let inserting = matches!(op, EntityOp::Insert { .. });
    match state.store.apply(table, op)? {
        OpResult::Written(entity) if inserting && !no_content => Ok(json_response(
            StatusCode::CREATED,
            vec![("etag", entity.etag.clone())],
            entity.to_json(None),
        )),
        OpResult::Written(entity) => Ok(self::no_content(Some(&entity.etag))),
        OpResult::Deleted => Ok(self::no_content(None)),
    }
}

// -- Batch ---------------------------------------------------------------------

/// One planned changeset operation.
struct PlannedOp {
    op: EntityOp,
    no_content: bool,
}

/// Decode the two-layer multipart request into raw sub-requests.
fn read_changeset(headers: &HeaderMap, body: Bytes) -> Result<Vec<RawRequest>, ServiceError> {
    let boundary = header(headers, "content-type")
        .and_then(multipart::content_type_boundary)
        .or_else(|| multipart::sniff_boundary(&body))
        .ok_or_else(|| invalid("batch request has no multipart boundary"))?;

    let changeset = MultipartReader::new(body, &boundary)
        .next()
        .ok_or_else(|| invalid("batch request contains no changeset"))?
        .map_err(|e| invalid(e.to_string()))?;
    let changeset_boundary = changeset
        .boundary()
        .or_else(|| multipart::sniff_boundary(&changeset.body))
        .ok_or_else(|| invalid("changeset has no multipart boundary"))?;

    MultipartReader::new(changeset.body.clone(), &changeset_boundary)
        .map(|part| {
            let part = part.map_err(|e| invalid(e.to_string()))?;
            wire::parse_request(&part.body).map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

/// Check changeset-wide rules and translate each sub-request.
fn plan_changeset(
    requests: &[RawRequest],
    max_operations: usize,
) -> Result<(String, Vec<PlannedOp>), (usize, ServiceError)> {
    if requests.len() > max_operations {
        return Err((
            max_operations,
            ServiceError::TooManyOperations {
                max: max_operations,
            },
        ));
    }

    let mut table_name: Option<String> = None;
    let mut partition: Option<String> = None;
    let mut rows = HashSet::new();
    let mut planned = Vec::with_capacity(requests.len());

    for (index, req) in requests.iter().enumerate() {
        let at = |e: ServiceError| (index, e);
        let uri: Uri = req
            .url
            .parse()
            .map_err(|_| at(invalid(format!("invalid request URL: {}", req.url))))?;
        let resource = parse_resource(uri.path()).map_err(at)?;
        if !matches!(resource, Resource::Collection(_) | Resource::Entity { .. }) {
            return Err(at(invalid("changeset operations must target entities")));
        }
        let method = effective_method(&req.method, req.header("X-HTTP-Method")).map_err(at)?;
        let body = req.body.as_deref().unwrap_or_default();
        let (table, op) = build_op(&method, resource, req.header("If-Match"), body).map_err(at)?;

        if let Some(first) = &table_name {
            if *first != table {
                return Err(at(invalid("all changeset operations must target one table")));
            }
        } else {
            table_name = Some(table);
        }
        let (pk, rk) = op.keys();
        if let Some(first) = &partition {
            if first != pk {
                return Err(at(ServiceError::CommandsInBatchActOnDifferentPartitions));
            }
        } else {
            partition = Some(pk.to_string());
        }
        if !rows.insert(rk.to_string()) {
            return Err(at(ServiceError::InvalidDuplicateRow));
        }

        planned.push(PlannedOp {
            op,
            no_content: prefers_no_content(req.header("Prefer")),
        });
    }

    let table = table_name.ok_or((0, invalid("changeset is empty")))?;
    Ok((table, planned))
}

fn sub_response(status: StatusCode, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut all = vec![("DataServiceVersion", "3.0;")];
    all.extend_from_slice(headers);
    wire::render_response(status, &all, body)
}

/// Render sub-responses for a committed changeset.
fn committed_parts(planned: &[PlannedOp], results: &[OpResult]) -> Vec<Vec<u8>> {
    planned
        .iter()
        .zip(results)
        .map(|(plan, result)| match (result, &plan.op) {
            (OpResult::Written(entity), EntityOp::Insert { .. }) if !plan.no_content => {
                sub_response(
                    StatusCode::CREATED,
                    &[("Content-Type", JSON_CONTENT_TYPE), ("ETag", entity.etag.as_str())],
                    entity.to_json(None).to_string().as_bytes(),
                )
            }
            (OpResult::Written(entity), EntityOp::Insert { .. }) => sub_response(
                StatusCode::NO_CONTENT,
                &[("ETag", entity.etag.as_str()), ("Preference-Applied", "return-no-content")],
                b"",
            ),
            (OpResult::Written(entity), _) => {
                sub_response(StatusCode::NO_CONTENT, &[("ETag", entity.etag.as_str())], b"")
            }
            (OpResult::Deleted, _) => sub_response(StatusCode::NO_CONTENT, &[], b""),
        })
        .collect()
}

fn failed_part(index: usize, err: &ServiceError) -> Vec<u8> {
    sub_response(
        err.status_code(),
        &[("Content-Type", JSON_CONTENT_TYPE)],
        err.odata_body(Some(index)).as_bytes(),
    )
}

/// Wrap rendered sub-responses in the two-layer multipart response.
fn batch_response(parts: Vec<Vec<u8>>) -> Response {
    let id = uuid::Uuid::new_v4();
    let mut changeset = MultipartWriter::new(format!("changesetresponse_{id}"));
    for part in &parts {
        changeset.write_part(
            &[
                ("Content-Type", "application/http"),
                ("Content-Transfer-Encoding", "binary"),
            ],
            part,
        );
    }
    let changeset_type = changeset.content_type();

    let mut batch = MultipartWriter::new(format!("batchresponse_{id}"));
    batch.write_part(&[("Content-Type", changeset_type.as_str())], &changeset.finish());
    let content_type = batch.content_type();

    (
        StatusCode::ACCEPTED,
        [
            ("content-type", content_type),
            ("dataserviceversion", format!("{DATA_SERVICE_VERSION};")),
        ],
        batch.finish(),
    )
        .into_response()
}

fn submit_batch(
    state: &EmulatorState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let requests = read_changeset(headers, body)?;
    if requests.is_empty() {
        return Err(invalid("changeset contains no operations"));
    }

    let planned = plan_changeset(&requests, state.config.max_batch_operations);
    let outcome = planned.and_then(|(table, planned)| {
        let ops = planned.iter().map(|p| p.op.clone()).collect();
        state
            .store
            .apply_batch(&table, ops)
            .map(|results| (table, planned, results))
    });

    match outcome {
        Ok((table, planned, results)) => {
            counter!(BATCHES_TOTAL, "outcome" => "committed").increment(1);
            counter!(BATCH_OPERATIONS_TOTAL).increment(results.len() as u64);
            info!(table = %table, operations = results.len(), "changeset committed");
            Ok(batch_response(committed_parts(&planned, &results)))
        }
        Err((index, err)) => {
            counter!(BATCHES_TOTAL, "outcome" => "failed").increment(1);
            warn!(index, code = err.code(), "changeset rejected: {}", err);
            Ok(batch_response(vec![failed_part(index, &err)]))
        }
    }
}

// -- Health check --------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}
