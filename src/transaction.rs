//! Transaction action descriptors.

use std::fmt;

use bytes::Bytes;

use crate::entity::Entity;
use crate::errors::Result;

/// The mutation an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// Insert a new entity; fails if it exists.
    Add,
    /// Delete an entity.
    Delete,
    /// Merge into an existing entity.
    UpdateMerge,
    /// Replace an existing entity.
    UpdateReplace,
    /// Merge into an entity, inserting it if absent.
    InsertMerge,
    /// Replace an entity, inserting it if absent.
    InsertReplace,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Add => "add",
            ActionType::Delete => "delete",
            ActionType::UpdateMerge => "update-merge",
            ActionType::UpdateReplace => "update-replace",
            ActionType::InsertMerge => "insert-merge",
            ActionType::InsertReplace => "insert-replace",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation inside an entity-group transaction.
///
/// `entity` holds the wire JSON of the entity.  It must carry string
/// `PartitionKey` and `RowKey` properties; this is checked when the
/// transaction is encoded, not here.
#[derive(Debug, Clone)]
pub struct TransactionAction {
    pub action_type: ActionType,
    pub entity: Bytes,
    pub if_match: Option<String>,
}

impl TransactionAction {
    pub fn new(action_type: ActionType, entity: impl Into<Bytes>) -> Self {
        Self {
            action_type,
            entity: entity.into(),
            if_match: None,
        }
    }

    /// Build an action from a typed entity.
    pub fn from_entity(action_type: ActionType, entity: &Entity) -> Result<Self> {
        Ok(Self::new(action_type, entity.to_json_bytes()?))
    }

    /// Attach a concurrency token.
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }
}
