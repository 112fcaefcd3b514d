//! Table service endpoint helpers.
//!
//! Resource paths:
//!   Table collection:  `{root}/{table}`
//!   Single entity:     `{root}/{table}(PartitionKey='{pk}',RowKey='{rk}')`
//!   Batch:             `{root}/$batch`
//!
//! Key values are OData-escaped (`'` doubled) and then percent-encoded.

use crate::entity::escape_key;
use crate::errors::{Result, TableError};

/// Host fragment of current Cosmos DB Table API endpoints.
const COSMOS_TABLE_DOMAIN: &str = ".table.cosmos.";

/// Host fragment of legacy Cosmos DB Table API endpoints.
const LEGACY_COSMOS_TABLE_DOMAIN: &str = ".table.cosmosdb.";

/// Port of the local Cosmos DB emulator's Table endpoint.
const COSMOS_EMULATOR_PORT: &str = "8902";

/// Encode everything except unreserved characters and the quote used by
/// key predicates.
const KEY_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'\'');

/// Split a table URL into `(service_root, table_name)`.
///
/// `https://acct.table.core.windows.net/mytable?sv=...` yields
/// `("https://acct.table.core.windows.net?sv=...", "mytable")`. Nested paths
/// keep everything but the last segment on the root.
pub fn parse_table_url(table_url: &str) -> Result<(String, String)> {
    let parsed = reqwest::Url::parse(table_url).map_err(|e| TableError::InvalidArgument {
        message: format!("invalid table URL {table_url}: {e}"),
    })?;
    let host = parsed.host_str().ok_or_else(|| TableError::InvalidArgument {
        message: format!("table URL {table_url} has no host"),
    })?;

    let mut root = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        root.push_str(&format!(":{port}"));
    }

    let segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let Some((table, prefix)) = segments.split_last() else {
        return Err(TableError::InvalidArgument {
            message: format!("table URL {table_url} does not name a table"),
        });
    };
    for segment in prefix {
        root.push('/');
        root.push_str(segment);
    }
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        root.push('?');
        root.push_str(query);
    }
    Ok((root, (*table).to_string()))
}

/// Whether `endpoint` is served by the Cosmos DB Table API.
///
/// Cosmos does not accept `PATCH` for merges, so callers rewrite it.
pub fn is_cosmos_endpoint(endpoint: &str) -> bool {
    let host = match reqwest::Url::parse(endpoint) {
        Ok(url) => {
            let mut host = url.host_str().unwrap_or_default().to_string();
            if let Some(port) = url.port() {
                host.push_str(&format!(":{port}"));
            }
            host
        }
        Err(_) => endpoint.to_string(),
    };
    let is_emulator = host.contains("localhost") && host.contains(COSMOS_EMULATOR_PORT);
    is_emulator || host.contains(COSMOS_TABLE_DOMAIN) || host.contains(LEGACY_COSMOS_TABLE_DOMAIN)
}

/// Separate a service root from any SAS query string it carries.
pub fn split_root(root: &str) -> (&str, Option<&str>) {
    match root.split_once('?') {
        Some((base, query)) if !query.is_empty() => (base.trim_end_matches('/'), Some(query)),
        Some((base, _)) => (base.trim_end_matches('/'), None),
        None => (root.trim_end_matches('/'), None),
    }
}

/// Percent-encode an escaped key value for a URL path.
fn encode_key(key: &str) -> String {
    percent_encoding::utf8_percent_encode(&escape_key(key), &KEY_ENCODE_SET).to_string()
}

/// Path of a single entity resource, relative to the service root.
pub fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "/{}(PartitionKey='{}',RowKey='{}')",
        table,
        encode_key(partition_key),
        encode_key(row_key)
    )
}

/// Path of the entity collection of a table.
pub fn table_path(table: &str) -> String {
    format!("/{table}")
}

/// Path of a table in the `Tables` collection.
pub fn table_resource_path(table: &str) -> String {
    format!("/Tables('{}')", encode_key(table))
}

/// Parse a key predicate `(PartitionKey='a',RowKey='b')` into its raw keys.
///
/// Expects the path to be percent-decoded already.
pub fn parse_key_predicate(predicate: &str) -> Option<(String, String)> {
    let inner = predicate.strip_prefix('(')?.strip_suffix(')')?;
    let rest = inner.strip_prefix("PartitionKey='")?;
    let (pk, rest) = split_quoted(rest)?;
    let rest = rest.strip_prefix(",RowKey='")?;
    let (rk, rest) = split_quoted(rest)?;
    if !rest.is_empty() {
        return None;
    }
    Some((pk, rk))
}

/// Read an OData quoted literal up to its closing quote, undoing `''`.
fn split_quoted(s: &str) -> Option<(String, &str)> {
    let bytes = s.as_bytes();
    let mut out = String::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                out.push_str(&s[start..=i]);
                i += 2;
                start = i;
                continue;
            }
            out.push_str(&s[start..i]);
            return Some((out, &s[i + 1..]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_url_simple() {
        let (root, table) = parse_table_url("https://acct.table.core.windows.net/people").unwrap();
        assert_eq!(root, "https://acct.table.core.windows.net");
        assert_eq!(table, "people");
    }

    #[test]
    fn test_parse_table_url_with_sas_and_port() {
        let (root, table) =
            parse_table_url("http://127.0.0.1:10002/devstoreaccount1/people?sv=2019-02-02&sig=abc")
                .unwrap();
        assert_eq!(root, "http://127.0.0.1:10002/devstoreaccount1?sv=2019-02-02&sig=abc");
        assert_eq!(table, "people");
    }

    #[test]
    fn test_parse_table_url_requires_table() {
        assert!(parse_table_url("https://acct.table.core.windows.net/").is_err());
        assert!(parse_table_url("not a url").is_err());
    }

    #[test]
    fn test_cosmos_detection() {
        assert!(is_cosmos_endpoint("https://acct.table.cosmos.azure.com"));
        assert!(is_cosmos_endpoint("https://acct.table.cosmosdb.azure.com:443/"));
        assert!(is_cosmos_endpoint("https://localhost:8902/"));
        assert!(!is_cosmos_endpoint("https://acct.table.core.windows.net"));
        assert!(!is_cosmos_endpoint("http://127.0.0.1:10002"));
        assert!(!is_cosmos_endpoint("https://localhost:10002"));
    }

    #[test]
    fn test_split_root() {
        assert_eq!(split_root("https://h/?sv=1"), ("https://h", Some("sv=1")));
        assert_eq!(split_root("https://h/"), ("https://h", None));
        assert_eq!(split_root("https://h?"), ("https://h", None));
    }

    #[test]
    fn test_entity_path_escapes_quotes_and_spaces() {
        assert_eq!(
            entity_path("t", "o'brien", "row 1"),
            "/t(PartitionKey='o''brien',RowKey='row%201')"
        );
        assert_eq!(entity_path("t", "a/b", "c"), "/t(PartitionKey='a%2Fb',RowKey='c')");
    }

    #[test]
    fn test_parse_key_predicate() {
        assert_eq!(
            parse_key_predicate("(PartitionKey='o''brien',RowKey='r,1')"),
            Some(("o'brien".to_string(), "r,1".to_string()))
        );
        assert_eq!(parse_key_predicate("()"), None);
        assert_eq!(parse_key_predicate("(PartitionKey='a')"), None);
        assert_eq!(parse_key_predicate("(PartitionKey='a',RowKey='b')x"), None);
    }

    #[test]
    fn test_table_resource_path() {
        assert_eq!(table_resource_path("people"), "/Tables('people')");
    }
}
