//! Table entity property bags and their OData JSON wire form.
//!
//! An [`Entity`] is a flat map of property name to [`EdmValue`].  Plain
//! strings, booleans and numbers travel as native JSON values.  Binary,
//! GUID, 64-bit integer and DateTime values (and non-finite doubles) travel
//! as strings with a sibling `<Name>@odata.type` property naming the EDM
//! type, e.g.
//!
//! ```text
//! { "Count": "9007199254740993", "Count@odata.type": "Edm.Int64" }
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Timelike, Utc};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::errors::{Result, TableError};

/// Name of the mandatory partition key property.
pub const PARTITION_KEY: &str = "PartitionKey";

/// Name of the mandatory row key property.
pub const ROW_KEY: &str = "RowKey";

/// Suffix of the sibling property carrying an EDM type annotation.
const ODATA_TYPE_SUFFIX: &str = "@odata.type";

/// Prefix of service metadata keys (`odata.etag`, `odata.metadata`, ...).
const ODATA_METADATA_PREFIX: &str = "odata.";

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum EdmValue {
    String(String),
    Bool(bool),
    Int32(i32),
    Double(f64),
    Int64(i64),
    Binary(Vec<u8>),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
}

impl EdmValue {
    /// EDM type name for values that need an explicit annotation.
    fn annotation(&self) -> Option<&'static str> {
        match self {
            EdmValue::Int64(_) => Some("Edm.Int64"),
            EdmValue::Binary(_) => Some("Edm.Binary"),
            EdmValue::Guid(_) => Some("Edm.Guid"),
            EdmValue::DateTime(_) => Some("Edm.DateTime"),
            EdmValue::Double(d) if !d.is_finite() => Some("Edm.Double"),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            EdmValue::String(s) => Value::String(s.clone()),
            EdmValue::Bool(b) => Value::Bool(*b),
            EdmValue::Int32(i) => Value::Number((*i).into()),
            EdmValue::Double(d) => match Number::from_f64(*d) {
                Some(n) => Value::Number(n),
                None if d.is_nan() => Value::String("NaN".to_string()),
                None if *d > 0.0 => Value::String("Infinity".to_string()),
                None => Value::String("-Infinity".to_string()),
            },
            EdmValue::Int64(i) => Value::String(i.to_string()),
            EdmValue::Binary(bytes) => Value::String(BASE64_STANDARD.encode(bytes)),
            EdmValue::Guid(g) => Value::String(g.hyphenated().to_string()),
            EdmValue::DateTime(dt) => Value::String(format_datetime(dt)),
        }
    }
}

impl From<&str> for EdmValue {
    fn from(s: &str) -> Self {
        EdmValue::String(s.to_string())
    }
}

impl From<String> for EdmValue {
    fn from(s: String) -> Self {
        EdmValue::String(s)
    }
}

impl From<bool> for EdmValue {
    fn from(b: bool) -> Self {
        EdmValue::Bool(b)
    }
}

impl From<i32> for EdmValue {
    fn from(i: i32) -> Self {
        EdmValue::Int32(i)
    }
}

impl From<i64> for EdmValue {
    fn from(i: i64) -> Self {
        EdmValue::Int64(i)
    }
}

impl From<f64> for EdmValue {
    fn from(d: f64) -> Self {
        EdmValue::Double(d)
    }
}

impl From<Vec<u8>> for EdmValue {
    fn from(b: Vec<u8>) -> Self {
        EdmValue::Binary(b)
    }
}

impl From<Uuid> for EdmValue {
    fn from(g: Uuid) -> Self {
        EdmValue::Guid(g)
    }
}

impl From<DateTime<Utc>> for EdmValue {
    fn from(dt: DateTime<Utc>) -> Self {
        EdmValue::DateTime(dt)
    }
}

/// A table entity: a flat, ordered property bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    properties: BTreeMap<String, EdmValue>,
}

impl Entity {
    /// Create an entity with the two mandatory keys set.
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        let mut entity = Self::default();
        entity.insert(PARTITION_KEY, partition_key.into());
        entity.insert(ROW_KEY, row_key.into());
        entity
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<EdmValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a property, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<EdmValue>) -> Option<EdmValue> {
        self.properties.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&EdmValue> {
        self.properties.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<EdmValue> {
        self.properties.remove(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EdmValue)> {
        self.properties.iter()
    }

    /// The `PartitionKey` value, if present and a string.
    pub fn partition_key(&self) -> Option<&str> {
        self.string_property(PARTITION_KEY)
    }

    /// The `RowKey` value, if present and a string.
    pub fn row_key(&self) -> Option<&str> {
        self.string_property(ROW_KEY)
    }

    fn string_property(&self, name: &str) -> Option<&str> {
        match self.properties.get(name) {
            Some(EdmValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Encode to the wire JSON object.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::with_capacity(self.properties.len());
        for (name, value) in &self.properties {
            map.insert(name.clone(), value.to_json());
            if let Some(edm) = value.annotation() {
                map.insert(
                    format!("{name}{ODATA_TYPE_SUFFIX}"),
                    Value::String(edm.to_string()),
                );
            }
        }
        map
    }

    /// Encode to wire JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Value::Object(self.to_json_map()))?)
    }

    /// Decode from wire JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value {
            Value::Object(map) => Self::from_json_map(&map),
            other => Err(TableError::Encoding {
                message: format!("entity must be a JSON object, got {}", json_type_name(&other)),
            }),
        }
    }

    /// Decode from a wire JSON object.
    pub fn from_json_map(map: &Map<String, Value>) -> Result<Self> {
        let mut properties = BTreeMap::new();
        for (name, value) in map {
            if name.starts_with(ODATA_METADATA_PREFIX) || name.ends_with(ODATA_TYPE_SUFFIX) {
                continue;
            }
            let annotation = map
                .get(&format!("{name}{ODATA_TYPE_SUFFIX}"))
                .and_then(Value::as_str);
            if let Some(decoded) = decode_property(name, value, annotation)? {
                properties.insert(name.clone(), decoded);
            }
        }
        Ok(Self { properties })
    }
}

fn decode_property(name: &str, value: &Value, annotation: Option<&str>) -> Result<Option<EdmValue>> {
    if value.is_null() {
        return Ok(None);
    }
    let typed = |edm: &str, message: String| TableError::EdmDecode {
        property: name.to_string(),
        edm_type: edm.to_string(),
        message,
    };
    let text = || value.as_str();

    let decoded = match annotation {
        Some(edm @ "Edm.Binary") => {
            let s = text().ok_or_else(|| typed(edm, "expected a base64 string".into()))?;
            let bytes = BASE64_STANDARD
                .decode(s)
                .map_err(|e| typed(edm, e.to_string()))?;
            EdmValue::Binary(bytes)
        }
        Some(edm @ "Edm.Guid") => {
            let s = text().ok_or_else(|| typed(edm, "expected a string".into()))?;
            EdmValue::Guid(Uuid::parse_str(s).map_err(|e| typed(edm, e.to_string()))?)
        }
        Some(edm @ "Edm.Int64") => {
            let parsed = match value {
                Value::String(s) => s.parse::<i64>().map_err(|e| typed(edm, e.to_string()))?,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| typed(edm, format!("{n} is not an integer")))?,
                _ => return Err(typed(edm, "expected a decimal string".into())),
            };
            EdmValue::Int64(parsed)
        }
        Some(edm @ "Edm.DateTime") => {
            let s = text().ok_or_else(|| typed(edm, "expected a string".into()))?;
            EdmValue::DateTime(parse_datetime(s).map_err(|e| typed(edm, e))?)
        }
        Some(edm @ "Edm.Double") => match value {
            Value::Number(n) => EdmValue::Double(
                n.as_f64()
                    .ok_or_else(|| typed(edm, format!("{n} is not a double")))?,
            ),
            Value::String(s) => EdmValue::Double(match s.as_str() {
                "NaN" => f64::NAN,
                "Infinity" | "INF" => f64::INFINITY,
                "-Infinity" | "-INF" => f64::NEG_INFINITY,
                other => other.parse::<f64>().map_err(|e| typed(edm, e.to_string()))?,
            }),
            _ => return Err(typed(edm, "expected a number".into())),
        },
        Some(edm @ "Edm.Int32") => {
            let n = value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| typed(edm, "expected a 32-bit integer".into()))?;
            EdmValue::Int32(n)
        }
        Some(edm @ "Edm.Boolean") => {
            EdmValue::Bool(value.as_bool().ok_or_else(|| typed(edm, "expected a boolean".into()))?)
        }
        Some(edm @ "Edm.String") => {
            EdmValue::String(text().ok_or_else(|| typed(edm, "expected a string".into()))?.to_string())
        }
        _ => decode_native(name, value)?,
    };
    Ok(Some(decoded))
}

fn decode_native(name: &str, value: &Value) -> Result<EdmValue> {
    match value {
        Value::String(s) => Ok(EdmValue::String(s.clone())),
        Value::Bool(b) => Ok(EdmValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(EdmValue::Int32(i))
            } else {
                n.as_f64().map(EdmValue::Double).ok_or_else(|| TableError::Encoding {
                    message: format!("property {name}: number {n} is out of range"),
                })
            }
        }
        other => Err(TableError::Encoding {
            message: format!(
                "property {name}: {} values are not supported in table entities",
                json_type_name(other)
            ),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Format a timestamp as `YYYY-MM-DDTHH:MM:SS[.fffffff]Z`.
///
/// Up to seven fractional digits (100ns ticks), trailing zeros trimmed.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    let base = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    // Leap-second nanos (>= 1e9) are folded into the last tick.
    let ticks = (dt.nanosecond().min(999_999_999)) / 100;
    let fraction = format!("{ticks:07}");
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{base}Z")
    } else {
        format!("{base}.{fraction}Z")
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

/// Current time truncated to the 100ns precision the wire format carries.
pub fn now_ticks() -> DateTime<Utc> {
    let now = Utc::now();
    let truncated = now.nanosecond() / 100 * 100;
    now.with_nanosecond(truncated).unwrap_or(now)
}

/// Escape a key value for use inside an OData key predicate (`'` -> `''`).
pub fn escape_key(key: &str) -> String {
    key.replace('\'', "''")
}

/// Undo [`escape_key`].
pub fn unescape_key(key: &str) -> String {
    key.replace("''", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entity() -> Entity {
        Entity::new("pk", "rk")
            .with("Name", "widget")
            .with("Enabled", true)
            .with("Count", 42)
            .with("Ratio", 0.25)
            .with("Big", 9_007_199_254_740_993_i64)
            .with("Blob", vec![0u8, 1, 2, 254, 255])
            .with(
                "Id",
                Uuid::parse_str("4fd7b5a5-8f0b-4b1e-9d0a-6d1f8c0e2a11").unwrap(),
            )
            .with(
                "When",
                Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap()
                    + chrono::Duration::nanoseconds(123_400),
            )
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let entity = sample_entity();
        let bytes = entity.to_json_bytes().unwrap();
        let decoded = Entity::from_json_bytes(&bytes).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_annotations_emitted_only_for_edm_kinds() {
        let map = sample_entity().to_json_map();
        assert_eq!(map["Big@odata.type"], "Edm.Int64");
        assert_eq!(map["Big"], "9007199254740993");
        assert_eq!(map["Blob@odata.type"], "Edm.Binary");
        assert_eq!(map["Blob"], "AAEC/v8=");
        assert_eq!(map["Id@odata.type"], "Edm.Guid");
        assert_eq!(map["When@odata.type"], "Edm.DateTime");
        assert_eq!(map["When"], "2021-03-04T05:06:07.0001234Z");
        assert!(!map.contains_key("Name@odata.type"));
        assert!(!map.contains_key("Count@odata.type"));
        assert!(!map.contains_key("Ratio@odata.type"));
        assert!(!map.contains_key("PartitionKey@odata.type"));
    }

    #[test]
    fn test_datetime_trims_trailing_zeros() {
        let whole = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();
        assert_eq!(format_datetime(&whole), "2006-01-02T15:04:05Z");

        let half = whole + chrono::Duration::milliseconds(500);
        assert_eq!(format_datetime(&half), "2006-01-02T15:04:05.5Z");

        let full = whole + chrono::Duration::nanoseconds(999_999_900);
        assert_eq!(format_datetime(&full), "2006-01-02T15:04:05.9999999Z");
    }

    #[test]
    fn test_decode_prefers_int32() {
        let decoded = Entity::from_json_bytes(br#"{"a":7,"b":3000000000,"c":1.5,"d":"x"}"#).unwrap();
        assert_eq!(decoded.get("a"), Some(&EdmValue::Int32(7)));
        assert_eq!(decoded.get("b"), Some(&EdmValue::Double(3_000_000_000.0)));
        assert_eq!(decoded.get("c"), Some(&EdmValue::Double(1.5)));
        assert_eq!(decoded.get("d"), Some(&EdmValue::String("x".into())));
    }

    #[test]
    fn test_double_with_integral_value_round_trips() {
        let entity = Entity::new("p", "r").with("Weight", 2.0);
        let decoded = Entity::from_json_bytes(&entity.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get("Weight"), Some(&EdmValue::Double(2.0)));
    }

    #[test]
    fn test_non_finite_doubles_use_annotation() {
        let entity = Entity::new("p", "r")
            .with("Up", f64::INFINITY)
            .with("Down", f64::NEG_INFINITY);
        let map = entity.to_json_map();
        assert_eq!(map["Up"], "Infinity");
        assert_eq!(map["Up@odata.type"], "Edm.Double");

        let decoded = Entity::from_json_bytes(&entity.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded, entity);

        let nan = Entity::from_json_bytes(br#"{"N":"NaN","N@odata.type":"Edm.Double"}"#).unwrap();
        assert!(matches!(nan.get("N"), Some(EdmValue::Double(d)) if d.is_nan()));
    }

    #[test]
    fn test_unknown_annotation_decodes_native() {
        let decoded =
            Entity::from_json_bytes(br#"{"X":"hello","X@odata.type":"Edm.Fancy"}"#).unwrap();
        assert_eq!(decoded.get("X"), Some(&EdmValue::String("hello".into())));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_service_metadata_is_skipped() {
        let body = br#"{"odata.etag":"W/\"x\"","odata.metadata":"m","PartitionKey":"p","RowKey":"r","Gone":null}"#;
        let decoded = Entity::from_json_bytes(body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.partition_key(), Some("p"));
        assert_eq!(decoded.row_key(), Some("r"));
    }

    #[test]
    fn test_bad_typed_value_fails_whole_decode() {
        let err = Entity::from_json_bytes(
            br#"{"PartitionKey":"p","Id":"not-a-guid","Id@odata.type":"Edm.Guid"}"#,
        )
        .unwrap_err();
        match err {
            TableError::EdmDecode {
                property, edm_type, ..
            } => {
                assert_eq!(property, "Id");
                assert_eq!(edm_type, "Edm.Guid");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = Entity::from_json_bytes(br#"{"B":"!!!","B@odata.type":"Edm.Binary"}"#).unwrap_err();
        assert!(matches!(err, TableError::EdmDecode { .. }));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            Entity::from_json_bytes(b"{not json"),
            Err(TableError::Json(_))
        ));
        assert!(matches!(
            Entity::from_json_bytes(b"[1,2]"),
            Err(TableError::Encoding { .. })
        ));
        assert!(matches!(
            Entity::from_json_bytes(br#"{"Nested":{"a":1}}"#),
            Err(TableError::Encoding { .. })
        ));
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("o'brien"), "o''brien");
        assert_eq!(escape_key("plain"), "plain");
        assert_eq!(unescape_key(&escape_key("a''b'")), "a''b'");
    }

    #[test]
    fn test_keys_are_not_escaped_in_json_body() {
        let entity = Entity::new("it's", "row'1");
        let map = entity.to_json_map();
        assert_eq!(map["PartitionKey"], "it's");
        assert_eq!(map["RowKey"], "row'1");
    }

    #[test]
    fn test_now_ticks_has_no_sub_tick_precision() {
        assert_eq!(now_ticks().nanosecond() % 100, 0);
    }
}
