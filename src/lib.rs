//! aztables: Azure Table Storage client with entity group transactions.
//!
//! The crate provides a typed entity model with EDM annotations, a
//! [`TableClient`] for single-entity operations and queries, and the
//! multipart `$batch` protocol used to submit atomic transactions against
//! one partition.  An in-memory [`emulator`] implements the same REST
//! surface for local development and tests.
//!
//! ```no_run
//! use aztables::{ActionType, Entity, SharedKeyCredential, TableServiceClient, TransactionAction};
//!
//! # async fn run() -> aztables::Result<()> {
//! let credential = SharedKeyCredential::new("account", "a2V5")?;
//! let service = TableServiceClient::new("https://account.table.core.windows.net", credential)?;
//! let table = service.table_client("people");
//!
//! let actions = vec![
//!     TransactionAction::from_entity(ActionType::Add, &Entity::new("p", "1").with("Name", "a"))?,
//!     TransactionAction::from_entity(ActionType::Add, &Entity::new("p", "2").with("Name", "b"))?,
//! ];
//! let response = table.submit_transaction(&actions).await?;
//! assert_eq!(response.sub_responses.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod emulator;
pub mod endpoint;
pub mod entity;
pub mod errors;
pub mod metrics;
pub mod multipart;
pub mod request;
pub mod transaction;
pub mod wire;

pub use acl::{AccessPolicy, SignedIdentifier};
pub use auth::{ConnectionString, SharedKeyCredential};
pub use batch::{SubResponse, TransactionResponse};
pub use client::{
    EntitiesPage, EntityPager, EntityResponse, GetEntityResponse, ListEntitiesOptions,
    TableClient, TablePager, TableServiceClient, UpdateMode,
};
pub use entity::{EdmValue, Entity};
pub use errors::{ErrorKind, Result, TableError};
pub use transaction::{ActionType, TransactionAction};
