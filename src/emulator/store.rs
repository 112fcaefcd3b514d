//! In-memory table store.
//!
//! Tables map `(PartitionKey, RowKey)` to stored entities in key order, so
//! queries and continuation tokens walk entities the same way the service
//! does.  Uses `RwLock` for thread-safe access; a changeset is applied to a
//! copy of its table under one write lock and swapped in only if every
//! operation succeeds.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::{Map, Value};

use super::error::ServiceError;
use crate::acl::SignedIdentifier;
use crate::entity::{format_datetime, PARTITION_KEY, ROW_KEY};

type EntityKey = (String, String);

const ODATA_TYPE_SUFFIX: &str = "@odata.type";
const TIMESTAMP: &str = "Timestamp";

/// An entity as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    /// User properties including keys and type annotations.
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub etag: String,
}

impl StoredEntity {
    pub fn partition_key(&self) -> &str {
        self.properties
            .get(PARTITION_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn row_key(&self) -> &str {
        self.properties
            .get(ROW_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Wire JSON with `odata.etag` and `Timestamp`, optionally projected.
    pub fn to_json(&self, select: Option<&[String]>) -> Value {
        let mut map = Map::new();
        map.insert("odata.etag".to_string(), Value::String(self.etag.clone()));
        let keep = |name: &str| {
            let base = name.strip_suffix(ODATA_TYPE_SUFFIX).unwrap_or(name);
            select.map_or(true, |s| s.iter().any(|n| n == base))
        };
        for (name, value) in &self.properties {
            if keep(name) {
                map.insert(name.clone(), value.clone());
            }
        }
        if keep(TIMESTAMP) {
            map.insert(
                TIMESTAMP.to_string(),
                Value::String(format_datetime(&self.timestamp)),
            );
            map.insert(
                format!("{TIMESTAMP}{ODATA_TYPE_SUFFIX}"),
                Value::String("Edm.DateTime".to_string()),
            );
        }
        Value::Object(map)
    }
}

/// A mutation against one entity.
#[derive(Debug, Clone)]
pub enum EntityOp {
    /// Insert; fails if the entity exists.
    Insert { properties: Map<String, Value> },
    /// Merge or replace.  With `if_match` the entity must exist (and match
    /// unless the token is `*`); without it the write is an upsert.
    Update {
        properties: Map<String, Value>,
        merge: bool,
        if_match: Option<String>,
    },
    Delete {
        partition_key: String,
        row_key: String,
        if_match: String,
    },
}

impl EntityOp {
    pub fn keys(&self) -> (&str, &str) {
        match self {
            EntityOp::Insert { properties } | EntityOp::Update { properties, .. } => (
                properties
                    .get(PARTITION_KEY)
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                properties
                    .get(ROW_KEY)
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ),
            EntityOp::Delete {
                partition_key,
                row_key,
                ..
            } => (partition_key, row_key),
        }
    }
}

/// Outcome of one applied operation.
#[derive(Debug, Clone)]
pub enum OpResult {
    Written(StoredEntity),
    Deleted,
}

/// One page of a table query.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub entities: Vec<StoredEntity>,
    /// Key of the first entity not returned.
    pub continuation: Option<(String, String)>,
}

#[derive(Debug, Default, Clone)]
struct Table {
    entities: BTreeMap<EntityKey, StoredEntity>,
    access_policies: Vec<SignedIdentifier>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing timestamps at 100ns resolution.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let tick = Duration::nanoseconds(100);
        let now = Utc::now();
        let now = now.duration_trunc(tick).unwrap_or(now);
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + tick,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Format a weak ETag from a timestamp.
pub fn etag_for(timestamp: &DateTime<Utc>) -> String {
    format!(
        "W/\"datetime'{}'\"",
        format_datetime(timestamp).replace(':', "%3A")
    )
}

fn check_if_match(existing: &StoredEntity, if_match: &str) -> Result<(), ServiceError> {
    if if_match == "*" || if_match == existing.etag {
        Ok(())
    } else {
        Err(ServiceError::UpdateConditionNotSatisfied)
    }
}

fn apply_op(table: &mut Table, op: EntityOp, timestamp: DateTime<Utc>) -> Result<OpResult, ServiceError> {
    let (pk, rk) = op.keys();
    let key = (pk.to_string(), rk.to_string());
    let etag = etag_for(&timestamp);

    match op {
        EntityOp::Insert { properties } => {
            if table.entities.contains_key(&key) {
                return Err(ServiceError::EntityAlreadyExists);
            }
            let stored = StoredEntity {
                properties,
                timestamp,
                etag,
            };
            table.entities.insert(key, stored.clone());
            Ok(OpResult::Written(stored))
        }
        EntityOp::Update {
            properties,
            merge,
            if_match,
        } => {
            let existing = table.entities.get(&key);
            if let Some(token) = &if_match {
                let existing = existing.ok_or(ServiceError::ResourceNotFound)?;
                check_if_match(existing, token)?;
            }
            let properties = match (merge, existing) {
                (true, Some(existing)) => {
                    let mut merged = existing.properties.clone();
                    for name in properties.keys() {
                        merged.remove(&format!("{name}{ODATA_TYPE_SUFFIX}"));
                    }
                    merged.extend(properties);
                    merged
                }
                _ => properties,
            };
            let stored = StoredEntity {
                properties,
                timestamp,
                etag,
            };
            table.entities.insert(key, stored.clone());
            Ok(OpResult::Written(stored))
        }
        EntityOp::Delete { if_match, .. } => {
            let existing = table
                .entities
                .get(&key)
                .ok_or(ServiceError::ResourceNotFound)?;
            check_if_match(existing, &if_match)?;
            table.entities.remove(&key);
            Ok(OpResult::Deleted)
        }
    }
}

pub struct TableStore {
    inner: RwLock<Inner>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, ServiceError> {
        self.inner
            .read()
            .map_err(|_| ServiceError::Internal("table store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, ServiceError> {
        self.inner
            .write()
            .map_err(|_| ServiceError::Internal("table store lock poisoned".to_string()))
    }

    pub fn create_table(&self, name: &str) -> Result<(), ServiceError> {
        let mut inner = self.write()?;
        if inner.tables.contains_key(name) {
            return Err(ServiceError::TableAlreadyExists);
        }
        inner.tables.insert(name.to_string(), Table::default());
        Ok(())
    }

    pub fn delete_table(&self, name: &str) -> Result<(), ServiceError> {
        self.write()?
            .tables
            .remove(name)
            .map(|_| ())
            .ok_or(ServiceError::ResourceNotFound)
    }

    /// Table names in order, starting at `from`, at most `top` of them.
    /// Returns the next table name when more remain.
    pub fn list_tables(
        &self,
        from: Option<&str>,
        top: usize,
    ) -> Result<(Vec<String>, Option<String>), ServiceError> {
        let inner = self.read()?;
        let mut names = inner
            .tables
            .keys()
            .filter(|name| from.map_or(true, |f| name.as_str() >= f));
        let page: Vec<String> = names.by_ref().take(top).cloned().collect();
        Ok((page, names.next().cloned()))
    }

    pub fn access_policies(&self, table: &str) -> Result<Vec<SignedIdentifier>, ServiceError> {
        let inner = self.read()?;
        let table = inner.tables.get(table).ok_or(ServiceError::TableNotFound)?;
        Ok(table.access_policies.clone())
    }

    /// Replace the table's stored access policies.
    pub fn set_access_policies(
        &self,
        table: &str,
        policies: Vec<SignedIdentifier>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.write()?;
        let table = inner.tables.get_mut(table).ok_or(ServiceError::TableNotFound)?;
        table.access_policies = policies;
        Ok(())
    }

    pub fn table_count(&self) -> usize {
        self.read().map(|inner| inner.tables.len()).unwrap_or(0)
    }

    pub fn get_entity(&self, table: &str, pk: &str, rk: &str) -> Result<StoredEntity, ServiceError> {
        let inner = self.read()?;
        let table = inner.tables.get(table).ok_or(ServiceError::TableNotFound)?;
        table
            .entities
            .get(&(pk.to_string(), rk.to_string()))
            .cloned()
            .ok_or(ServiceError::ResourceNotFound)
    }

    /// Entities in key order, optionally limited to one partition, starting
    /// at `from`.
    pub fn query(
        &self,
        table: &str,
        partition: Option<&str>,
        from: Option<(String, String)>,
        top: usize,
    ) -> Result<QueryPage, ServiceError> {
        let inner = self.read()?;
        let table = inner.tables.get(table).ok_or(ServiceError::TableNotFound)?;
        let mut matching = table
            .entities
            .iter()
            .filter(|(key, _)| from.as_ref().map_or(true, |f| *key >= f))
            .filter(|(key, _)| partition.map_or(true, |p| key.0 == p));
        let entities = matching
            .by_ref()
            .take(top)
            .map(|(_, e)| e.clone())
            .collect();
        let continuation = matching.next().map(|(key, _)| key.clone());
        Ok(QueryPage {
            entities,
            continuation,
        })
    }

    /// Apply one operation.
    pub fn apply(&self, table: &str, op: EntityOp) -> Result<OpResult, ServiceError> {
        let mut inner = self.write()?;
        let timestamp = inner.next_timestamp();
        let table = inner.tables.get_mut(table).ok_or(ServiceError::TableNotFound)?;
        apply_op(table, op, timestamp)
    }

    /// Apply every operation or none.  On failure returns the index of the
    /// failing operation with its error.
    pub fn apply_batch(
        &self,
        table: &str,
        ops: Vec<EntityOp>,
    ) -> Result<Vec<OpResult>, (usize, ServiceError)> {
        let mut inner = self.write().map_err(|e| (0, e))?;
        let timestamp = inner.next_timestamp();
        let mut working = inner
            .tables
            .get(table)
            .cloned()
            .ok_or((0, ServiceError::TableNotFound))?;

        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            results.push(apply_op(&mut working, op, timestamp).map_err(|e| (index, e))?);
        }
        inner.tables.insert(table.to_string(), working);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pk: &str, rk: &str, extra: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(PARTITION_KEY.to_string(), json!(pk));
        map.insert(ROW_KEY.to_string(), json!(rk));
        if let Value::Object(extra) = extra {
            map.extend(extra);
        }
        map
    }

    fn insert(pk: &str, rk: &str) -> EntityOp {
        EntityOp::Insert {
            properties: props(pk, rk, json!({})),
        }
    }

    fn store_with_table() -> TableStore {
        let store = TableStore::new();
        store.create_table("people").unwrap();
        store
    }

    #[test]
    fn test_create_and_delete_table() {
        let store = TableStore::new();
        store.create_table("alpha").unwrap();
        assert!(matches!(
            store.create_table("alpha"),
            Err(ServiceError::TableAlreadyExists)
        ));
        assert_eq!(store.table_count(), 1);
        store.delete_table("alpha").unwrap();
        assert!(matches!(
            store.delete_table("alpha"),
            Err(ServiceError::ResourceNotFound)
        ));
    }

    #[test]
    fn test_access_policies_replace() {
        let store = store_with_table();
        assert!(store.access_policies("people").unwrap().is_empty());

        let first = vec![SignedIdentifier {
            id: "one".to_string(),
            access_policy: None,
        }];
        store.set_access_policies("people", first.clone()).unwrap();
        assert_eq!(store.access_policies("people").unwrap(), first);
        store.set_access_policies("people", Vec::new()).unwrap();
        assert!(store.access_policies("people").unwrap().is_empty());

        assert!(matches!(
            store.access_policies("missing"),
            Err(ServiceError::TableNotFound)
        ));
        assert!(matches!(
            store.set_access_policies("missing", first),
            Err(ServiceError::TableNotFound)
        ));
    }

    #[test]
    fn test_list_tables_pages() {
        let store = TableStore::new();
        for name in ["c", "a", "b"] {
            store.create_table(name).unwrap();
        }
        let (page, next) = store.list_tables(None, 2).unwrap();
        assert_eq!(page, vec!["a", "b"]);
        assert_eq!(next.as_deref(), Some("c"));
        let (page, next) = store.list_tables(next.as_deref(), 2).unwrap();
        assert_eq!(page, vec!["c"]);
        assert!(next.is_none());
    }

    #[test]
    fn test_insert_conflict_and_get() {
        let store = store_with_table();
        let written = store.apply("people", insert("p", "1")).unwrap();
        let OpResult::Written(stored) = written else {
            panic!("expected write");
        };
        assert!(stored.etag.starts_with("W/\"datetime'"));
        assert!(matches!(
            store.apply("people", insert("p", "1")),
            Err(ServiceError::EntityAlreadyExists)
        ));
        assert_eq!(store.get_entity("people", "p", "1").unwrap(), stored);
        assert!(matches!(
            store.get_entity("missing", "p", "1"),
            Err(ServiceError::TableNotFound)
        ));
    }

    #[test]
    fn test_update_semantics() {
        let store = store_with_table();
        // Upsert without If-Match inserts.
        store
            .apply(
                "people",
                EntityOp::Update {
                    properties: props("p", "1", json!({"a": 1, "b@odata.type": "Edm.Int64", "b": "5"})),
                    merge: true,
                    if_match: None,
                },
            )
            .unwrap();

        // Update with If-Match requires existence.
        assert!(matches!(
            store.apply(
                "people",
                EntityOp::Update {
                    properties: props("p", "2", json!({})),
                    merge: false,
                    if_match: Some("*".to_string()),
                },
            ),
            Err(ServiceError::ResourceNotFound)
        ));

        // Merge keeps old properties and drops stale annotations.
        store
            .apply(
                "people",
                EntityOp::Update {
                    properties: props("p", "1", json!({"b": 7})),
                    merge: true,
                    if_match: Some("*".to_string()),
                },
            )
            .unwrap();
        let merged = store.get_entity("people", "p", "1").unwrap();
        assert_eq!(merged.properties["a"], json!(1));
        assert_eq!(merged.properties["b"], json!(7));
        assert!(!merged.properties.contains_key("b@odata.type"));

        // Replace drops them.
        store
            .apply(
                "people",
                EntityOp::Update {
                    properties: props("p", "1", json!({"c": true})),
                    merge: false,
                    if_match: Some(merged.etag.clone()),
                },
            )
            .unwrap();
        let replaced = store.get_entity("people", "p", "1").unwrap();
        assert!(!replaced.properties.contains_key("a"));
        assert_ne!(replaced.etag, merged.etag);

        // Stale ETag.
        assert!(matches!(
            store.apply(
                "people",
                EntityOp::Delete {
                    partition_key: "p".to_string(),
                    row_key: "1".to_string(),
                    if_match: merged.etag,
                },
            ),
            Err(ServiceError::UpdateConditionNotSatisfied)
        ));
    }

    #[test]
    fn test_query_partition_and_continuation() {
        let store = store_with_table();
        for (pk, rk) in [("a", "1"), ("b", "1"), ("b", "2"), ("b", "3"), ("c", "1")] {
            store.apply("people", insert(pk, rk)).unwrap();
        }
        let page = store.query("people", Some("b"), None, 2).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.continuation, Some(("b".to_string(), "3".to_string())));

        let page = store
            .query("people", Some("b"), page.continuation, 2)
            .unwrap();
        assert_eq!(page.entities.len(), 1);
        assert_eq!(page.entities[0].row_key(), "3");
        assert!(page.continuation.is_none());

        assert_eq!(store.query("people", None, None, 1000).unwrap().entities.len(), 5);
    }

    #[test]
    fn test_apply_batch_is_atomic() {
        let store = store_with_table();
        store.apply("people", insert("p", "2")).unwrap();

        let err = store
            .apply_batch("people", vec![insert("p", "1"), insert("p", "2"), insert("p", "3")])
            .unwrap_err();
        assert_eq!(err.0, 1);
        assert!(matches!(err.1, ServiceError::EntityAlreadyExists));
        assert!(store.get_entity("people", "p", "1").is_err());

        let results = store
            .apply_batch("people", vec![insert("p", "1"), insert("p", "3")])
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(store.query("people", None, None, 10).unwrap().entities.len(), 3);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut inner = Inner::default();
        let a = inner.next_timestamp();
        let b = inner.next_timestamp();
        assert!(b > a);
        assert_ne!(etag_for(&a), etag_for(&b));
    }

    #[test]
    fn test_to_json_projection() {
        let stored = StoredEntity {
            properties: props("p", "r", json!({"Name": "n", "Age": 3, "Big@odata.type": "Edm.Int64", "Big": "9"})),
            timestamp: Utc::now(),
            etag: "W/\"x\"".to_string(),
        };
        let full = stored.to_json(None);
        assert_eq!(full["odata.etag"], "W/\"x\"");
        assert_eq!(full["Timestamp@odata.type"], "Edm.DateTime");

        let select = vec!["Name".to_string(), "Big".to_string()];
        let projected = stored.to_json(Some(select.as_slice()));
        assert_eq!(projected["Name"], "n");
        assert_eq!(projected["Big@odata.type"], "Edm.Int64");
        assert!(projected.get("Age").is_none());
        assert!(projected.get("Timestamp").is_none());
    }
}
