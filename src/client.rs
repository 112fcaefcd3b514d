//! Table service client.
//!
//! [`TableServiceClient`] addresses an account (table management, listing);
//! [`TableClient`] addresses one table (entity CRUD, queries, and
//! entity-group transactions).  Both wrap a shared `reqwest::Client` and are
//! cheap to clone.
//!
//! Credentials are resolved from, in order:
//!   - an explicit [`SharedKeyCredential`] (Shared Key auth)
//!   - a SAS token (appended to every request URL)
//!   - a connection string carrying either of the above

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::acl::{
    check_identifier_count, decode_signed_identifiers, encode_signed_identifiers,
    SignedIdentifier, ACL_CONTENT_TYPE,
};
use crate::auth::{canonical_resource, ConnectionString, SharedKeyCredential};
use crate::batch::{build_batch, parse_transaction_response, TransactionResponse};
use crate::config::ClientConfig;
use crate::endpoint::{parse_table_url, split_root, table_path, table_resource_path};
use crate::entity::Entity;
use crate::errors::{Result, TableError};
use crate::request::{
    base_request, build_entity_request, build_get_request, RequestTarget, API_VERSION,
    DATA_SERVICE_VERSION,
};
use crate::transaction::{ActionType, TransactionAction};
use crate::wire::RawRequest;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How requests are authorized.
#[derive(Debug, Clone)]
enum TableAuth {
    SharedKey(SharedKeyCredential),
    Sas(String),
    Anonymous,
}

/// A fully drained HTTP response.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn etag(&self) -> Option<String> {
        self.header("etag")
    }

    /// Turn a non-2xx response into [`TableError::Service`].
    fn ensure_success(self, operation: &str) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        warn!(operation, status = %self.status, "table request failed");
        Err(TableError::from_service_body(self.status.as_u16(), &self.body))
    }
}

struct Inner {
    http: reqwest::Client,
    /// Service root without SAS query or trailing slash.
    endpoint: String,
    auth: TableAuth,
}

/// Client for account-level operations.
#[derive(Clone)]
pub struct TableServiceClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TableServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableServiceClient")
            .field("endpoint", &self.inner.endpoint)
            .field("auth", &self.inner.auth)
            .finish()
    }
}

impl TableServiceClient {
    fn build(endpoint: &str, auth: TableAuth, timeout: Duration) -> Result<Self> {
        let (base, sas) = split_root(endpoint);
        if base.is_empty() {
            return Err(TableError::InvalidArgument {
                message: "endpoint is empty".to_string(),
            });
        }
        let auth = match (auth, sas) {
            (TableAuth::Anonymous, Some(sas)) => TableAuth::Sas(sas.to_string()),
            (auth, _) => auth,
        };

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        info!(
            "Table service client initialized: endpoint={} auth={}",
            base,
            match &auth {
                TableAuth::SharedKey(_) => "shared-key",
                TableAuth::Sas(_) => "sas",
                TableAuth::Anonymous => "anonymous",
            }
        );

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoint: base.to_string(),
                auth,
            }),
        })
    }

    /// Client authorized with Shared Key.
    pub fn new(endpoint: &str, credential: SharedKeyCredential) -> Result<Self> {
        Self::build(
            endpoint,
            TableAuth::SharedKey(credential),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Client authorized with a SAS token (leading `?` optional).
    pub fn with_sas(endpoint: &str, sas_token: &str) -> Result<Self> {
        let token = sas_token.strip_prefix('?').unwrap_or(sas_token);
        Self::build(
            endpoint,
            TableAuth::Sas(token.to_string()),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Client without credentials, or with a SAS query already on `endpoint`.
    pub fn anonymous(endpoint: &str) -> Result<Self> {
        Self::build(
            endpoint,
            TableAuth::Anonymous,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let parsed = ConnectionString::parse(conn_str)?;
        Self::from_parsed(parsed, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    fn from_parsed(parsed: ConnectionString, timeout: Duration) -> Result<Self> {
        let auth = match (parsed.credential, parsed.sas_token) {
            (Some(credential), _) => TableAuth::SharedKey(credential),
            (None, Some(sas)) => TableAuth::Sas(sas),
            (None, None) => TableAuth::Anonymous,
        };
        Self::build(&parsed.endpoint, auth, timeout)
    }

    /// Client described by the `client` configuration section.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        if let Some(conn_str) = &config.connection_string {
            return Self::from_parsed(ConnectionString::parse(conn_str)?, timeout);
        }
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| TableError::Config {
                message: "client config needs connection_string or endpoint".to_string(),
            })?;
        let auth = match (&config.account, &config.account_key, &config.sas_token) {
            (Some(account), Some(key), _) => {
                TableAuth::SharedKey(SharedKeyCredential::new(account.clone(), key)?)
            }
            (_, _, Some(sas)) => TableAuth::Sas(sas.strip_prefix('?').unwrap_or(sas).to_string()),
            _ => TableAuth::Anonymous,
        };
        Self::build(endpoint, auth, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Client for one table in this account.
    pub fn table_client(&self, table: impl Into<String>) -> TableClient {
        let table = table.into();
        TableClient {
            target: RequestTarget::new(&self.inner.endpoint, table),
            service: self.clone(),
        }
    }

    // -- Transport -------------------------------------------------------------

    /// Send a request, sign it, and read the whole response body.
    async fn execute(&self, req: RawRequest, query: &[(&str, String)]) -> Result<RawResponse> {
        let mut url = reqwest::Url::parse(&req.url).map_err(|e| TableError::InvalidArgument {
            message: format!("invalid request URL {}: {e}", req.url),
        })?;
        if let TableAuth::Sas(token) = &self.inner.auth {
            url.set_query(Some(token));
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }

        let date = httpdate::fmt_http_date(SystemTime::now());
        let mut builder = self
            .inner
            .http
            .request(req.method.clone(), url.clone())
            .header("x-ms-date", &date);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let TableAuth::SharedKey(credential) = &self.inner.auth {
            let resource = canonical_resource(credential.account(), url.path(), url.query());
            let authorization = credential.sign(
                req.method.as_str(),
                req.header("Content-MD5").unwrap_or_default(),
                req.header("Content-Type").unwrap_or_default(),
                &date,
                &resource,
            )?;
            builder = builder.header("Authorization", authorization);
        }

        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        debug!(method = %req.method, path = url.path(), "sending table request");
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        debug!(%status, bytes = body.len(), "table response received");

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    // -- Tables ----------------------------------------------------------------

    /// Create a table and return a client for it.
    pub async fn create_table(&self, table: &str) -> Result<TableClient> {
        let mut req = base_request(
            Method::POST,
            format!("{}{}", self.inner.endpoint, table_path("Tables")),
        );
        let body = serde_json::to_vec(&json!({ "TableName": table }))?;
        req.set_header("Content-Type", "application/json");
        req.set_header("Content-Length", body.len().to_string());
        req.set_header("Prefer", "return-no-content");
        req.body = Some(Bytes::from(body));

        self.execute(req, &[]).await?.ensure_success("create_table")?;
        info!("Created table {}", table);
        Ok(self.table_client(table))
    }

    pub async fn delete_table(&self, table: &str) -> Result<()> {
        let req = base_request(
            Method::DELETE,
            format!("{}{}", self.inner.endpoint, table_resource_path(table)),
        );
        self.execute(req, &[]).await?.ensure_success("delete_table")?;
        info!("Deleted table {}", table);
        Ok(())
    }

    /// Page through the tables in the account.
    pub fn list_tables(&self, filter: Option<String>) -> TablePager {
        TablePager {
            client: self.clone(),
            filter,
            next_table: None,
            done: false,
        }
    }
}

// -- Pagination ---------------------------------------------------------------

#[derive(Deserialize)]
struct TablesBody {
    #[serde(default)]
    value: Vec<TableItem>,
}

#[derive(Deserialize)]
struct TableItem {
    #[serde(rename = "TableName")]
    name: String,
}

/// Pager over `GET /Tables`.
pub struct TablePager {
    client: TableServiceClient,
    filter: Option<String>,
    next_table: Option<String>,
    done: bool,
}

impl TablePager {
    /// Fetch the next page of table names, or `None` when exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let mut query = Vec::new();
        if let Some(filter) = &self.filter {
            query.push(("$filter", filter.clone()));
        }
        if let Some(next) = &self.next_table {
            query.push(("NextTableName", next.clone()));
        }

        let req = base_request(
            Method::GET,
            format!("{}{}", self.client.inner.endpoint, table_path("Tables")),
        );
        let resp = self
            .client
            .execute(req, &query)
            .await?
            .ensure_success("list_tables")?;

        self.next_table = resp.header("x-ms-continuation-NextTableName");
        self.done = self.next_table.is_none();

        let body: TablesBody = serde_json::from_slice(&resp.body)?;
        Ok(Some(body.value.into_iter().map(|t| t.name).collect()))
    }

    /// Drain every page.
    pub async fn collect_all(mut self) -> Result<Vec<String>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

/// Query options for [`TableClient::list_entities`].
#[derive(Debug, Clone, Default)]
pub struct ListEntitiesOptions {
    /// OData `$filter` expression.
    pub filter: Option<String>,
    /// Comma-separated property projection.
    pub select: Option<String>,
    /// Page size.
    pub top: Option<u32>,
    /// Resume from this partition key.
    pub partition_key: Option<String>,
    /// Resume from this row key (with `partition_key`).
    pub row_key: Option<String>,
}

/// One page of a query.
#[derive(Debug, Clone)]
pub struct EntitiesPage {
    pub entities: Vec<Entity>,
    pub next_partition_key: Option<String>,
    pub next_row_key: Option<String>,
}

#[derive(Deserialize)]
struct EntitiesBody {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

/// Pager over a table query.
pub struct EntityPager {
    client: TableClient,
    options: ListEntitiesOptions,
    done: bool,
}

impl EntityPager {
    /// Fetch the next page, or `None` when exhausted.
    pub async fn next_page(&mut self) -> Result<Option<EntitiesPage>> {
        if self.done {
            return Ok(None);
        }
        let options = &self.options;
        let mut query = Vec::new();
        if let Some(filter) = &options.filter {
            query.push(("$filter", filter.clone()));
        }
        if let Some(select) = &options.select {
            query.push(("$select", select.clone()));
        }
        if let Some(top) = options.top {
            query.push(("$top", top.to_string()));
        }
        if let Some(pk) = &options.partition_key {
            query.push(("NextPartitionKey", pk.clone()));
        }
        if let Some(rk) = &options.row_key {
            query.push(("NextRowKey", rk.clone()));
        }

        let target = &self.client.target;
        let req = base_request(Method::GET, format!("{}()", target.collection_url()));
        let resp = self
            .client
            .service
            .execute(req, &query)
            .await?
            .ensure_success("list_entities")?;

        let page = EntitiesPage {
            next_partition_key: resp.header("x-ms-continuation-NextPartitionKey"),
            next_row_key: resp.header("x-ms-continuation-NextRowKey"),
            entities: serde_json::from_slice::<EntitiesBody>(&resp.body)?
                .value
                .iter()
                .map(Entity::from_json_map)
                .collect::<Result<_>>()?,
        };

        self.options.partition_key = page.next_partition_key.clone();
        self.options.row_key = page.next_row_key.clone();
        self.done = page.next_partition_key.is_none();
        Ok(Some(page))
    }

    /// Drain every page.
    pub async fn collect_all(mut self) -> Result<Vec<Entity>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.entities);
        }
        Ok(all)
    }
}

// -- Table client -------------------------------------------------------------

/// Merge or replace semantics for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Merge,
    Replace,
}

/// Result of a write: the new entity ETag, when the service returned one.
#[derive(Debug, Clone)]
pub struct EntityResponse {
    pub etag: Option<String>,
}

/// Result of a point read.
#[derive(Debug, Clone)]
pub struct GetEntityResponse {
    pub entity: Entity,
    pub etag: Option<String>,
}

/// Client for a single table.
#[derive(Debug, Clone)]
pub struct TableClient {
    service: TableServiceClient,
    target: RequestTarget,
}

impl TableClient {
    /// Client for the table named by a full table URL.
    ///
    /// A SAS query on the URL is used for authorization when no credential
    /// is given.
    pub fn from_url(table_url: &str, credential: Option<SharedKeyCredential>) -> Result<Self> {
        let (root, table) = parse_table_url(table_url)?;
        let service = match credential {
            Some(credential) => TableServiceClient::new(&root, credential)?,
            None => TableServiceClient::anonymous(&root)?,
        };
        Ok(service.table_client(table))
    }

    pub fn table_name(&self) -> &str {
        &self.target.table
    }

    /// Whether merges are rewritten for the Cosmos Table API.
    pub fn is_cosmos(&self) -> bool {
        self.target.cosmos
    }

    async fn write(
        &self,
        operation: &str,
        action_type: ActionType,
        entity: &[u8],
        if_match: Option<&str>,
    ) -> Result<EntityResponse> {
        let req = build_entity_request(&self.target, action_type, entity, if_match)?;
        let resp = self
            .service
            .execute(req, &[])
            .await?
            .ensure_success(operation)?;
        Ok(EntityResponse { etag: resp.etag() })
    }

    /// Insert an entity; fails with 409 if it exists.
    pub async fn add_entity(&self, entity: &Entity) -> Result<EntityResponse> {
        self.write("add_entity", ActionType::Add, &entity.to_json_bytes()?, None)
            .await
    }

    pub async fn get_entity(&self, partition_key: &str, row_key: &str) -> Result<GetEntityResponse> {
        let req = build_get_request(&self.target, partition_key, row_key);
        let resp = self
            .service
            .execute(req, &[])
            .await?
            .ensure_success("get_entity")?;
        let entity = Entity::from_json_bytes(&resp.body)?;
        let etag = resp.etag().or_else(|| {
            serde_json::from_slice::<Value>(&resp.body)
                .ok()
                .and_then(|v| v.get("odata.etag").and_then(Value::as_str).map(str::to_string))
        });
        Ok(GetEntityResponse { entity, etag })
    }

    /// Update an existing entity.  `if_match` defaults to `*`.
    pub async fn update_entity(
        &self,
        entity: &Entity,
        mode: UpdateMode,
        if_match: Option<&str>,
    ) -> Result<EntityResponse> {
        let action_type = match mode {
            UpdateMode::Merge => ActionType::UpdateMerge,
            UpdateMode::Replace => ActionType::UpdateReplace,
        };
        self.write(
            "update_entity",
            action_type,
            &entity.to_json_bytes()?,
            Some(if_match.unwrap_or(crate::request::MATCH_ANY)),
        )
        .await
    }

    /// Insert or update an entity unconditionally.
    pub async fn upsert_entity(&self, entity: &Entity, mode: UpdateMode) -> Result<EntityResponse> {
        let action_type = match mode {
            UpdateMode::Merge => ActionType::InsertMerge,
            UpdateMode::Replace => ActionType::InsertReplace,
        };
        self.write("upsert_entity", action_type, &entity.to_json_bytes()?, None)
            .await
    }

    /// Delete an entity.  `if_match` defaults to `*`.
    pub async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: Option<&str>,
    ) -> Result<()> {
        let keys = Entity::new(partition_key, row_key).to_json_bytes()?;
        self.write("delete_entity", ActionType::Delete, &keys, if_match)
            .await?;
        Ok(())
    }

    /// Page through entities matching `options`.
    pub fn list_entities(&self, options: ListEntitiesOptions) -> EntityPager {
        EntityPager {
            client: self.clone(),
            options,
            done: false,
        }
    }

    // -- Access policies --------------------------------------------------------

    fn acl_request(&self, method: Method) -> RawRequest {
        let mut req = RawRequest::new(
            method,
            format!("{}{}", self.target.root, table_path(&self.target.table)),
        );
        req.set_header("x-ms-version", API_VERSION);
        req
    }

    /// Stored access policies on this table.
    pub async fn get_access_policy(&self) -> Result<Vec<SignedIdentifier>> {
        let req = self.acl_request(Method::GET);
        let resp = self
            .service
            .execute(req, &[("comp", "acl".to_string())])
            .await?
            .ensure_success("get_access_policy")?;
        decode_signed_identifiers(&resp.body)
    }

    /// Replace the stored access policies on this table.  An empty slice
    /// clears them.
    pub async fn set_access_policy(&self, identifiers: &[SignedIdentifier]) -> Result<()> {
        check_identifier_count(identifiers)?;
        let body = encode_signed_identifiers(identifiers)?;

        let mut req = self.acl_request(Method::PUT);
        req.set_header("Content-Type", ACL_CONTENT_TYPE);
        req.set_header("Content-Length", body.len().to_string());
        req.body = Some(Bytes::from(body));

        self.service
            .execute(req, &[("comp", "acl".to_string())])
            .await?
            .ensure_success("set_access_policy")?;
        debug!(table = %self.target.table, policies = identifiers.len(), "access policies set");
        Ok(())
    }

    /// Submit `actions` as one atomic entity-group transaction.
    ///
    /// Local validation failures (empty, missing keys, mixed partitions)
    /// return before anything is sent.
    pub async fn submit_transaction(&self, actions: &[TransactionAction]) -> Result<TransactionResponse> {
        let batch = build_batch(actions, &self.target)?;

        let mut req = RawRequest::new(Method::POST, format!("{}/$batch", self.target.root));
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), crate::request::ACCEPT_MINIMAL_METADATA.to_string());
        headers.insert("Content-Type".to_string(), batch.content_type());
        headers.insert("DataServiceVersion".to_string(), DATA_SERVICE_VERSION.to_string());
        headers.insert("MaxDataServiceVersion".to_string(), DATA_SERVICE_VERSION.to_string());
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        req.headers = headers;
        req.body = Some(Bytes::from(batch.body));

        debug!(
            table = %self.target.table,
            actions = actions.len(),
            boundary = %batch.batch_boundary,
            "submitting transaction"
        );
        let resp = self.service.execute(req, &[]).await?;
        let result = parse_transaction_response(resp.status, resp.body, actions.len());
        match &result {
            Ok(r) => debug!(operations = r.sub_responses.len(), "transaction committed"),
            Err(e) => warn!(error = %e, "transaction failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DEV_ACCOUNT_KEY, DEV_ACCOUNT_NAME};
    use crate::config::EmulatorConfig;
    use crate::emulator::{self, EmulatorState};

    /// Start an emulator on an ephemeral port and return its endpoint.
    async fn start_emulator(require_auth: bool) -> String {
        let config = EmulatorConfig {
            require_auth,
            ..EmulatorConfig::default()
        };
        let state = Arc::new(EmulatorState::new(config).unwrap());
        let app = emulator::app(state, false);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn credential() -> SharedKeyCredential {
        SharedKeyCredential::new(DEV_ACCOUNT_NAME, DEV_ACCOUNT_KEY).unwrap()
    }

    async fn table(name: &str) -> TableClient {
        let endpoint = start_emulator(true).await;
        let service = TableServiceClient::new(&endpoint, credential()).unwrap();
        service.create_table(name).await.unwrap()
    }

    fn add(row: &str) -> TransactionAction {
        TransactionAction::from_entity(
            ActionType::Add,
            &Entity::new("partition", row).with("Value", row.to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_transaction_of_five_adds() {
        let table = table("scenarioa").await;
        let actions: Vec<_> = (1..=5).map(|i| add(&i.to_string())).collect();

        let resp = table.submit_transaction(&actions).await.unwrap();
        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert_eq!(resp.sub_responses.len(), 5);
        assert!(resp.sub_responses.iter().all(|r| r.status.is_success()));

        let entities = table
            .list_entities(ListEntitiesOptions {
                filter: Some("PartitionKey eq 'partition'".to_string()),
                ..Default::default()
            })
            .collect_all()
            .await
            .unwrap();
        assert_eq!(entities.len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_adds_fail_atomically() {
        let table = table("scenariob").await;
        let actions = vec![add("1"), add("1")];

        match table.submit_transaction(&actions).await {
            Err(TableError::TransactionFailed { index, status, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(index, Some(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let entities = table
            .list_entities(ListEntitiesOptions::default())
            .collect_all()
            .await
            .unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_conflict_with_existing_entity() {
        let table = table("conflicts").await;
        table.add_entity(&Entity::new("partition", "2")).await.unwrap();

        let actions = vec![add("1"), add("2"), add("3")];
        match table.submit_transaction(&actions).await {
            Err(TableError::TransactionFailed { index, status, code, .. }) => {
                assert_eq!(index, Some(1));
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some("EntityAlreadyExists"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(table.get_entity("partition", "1").await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_delete_without_etag() {
        let table = table("scenarioc").await;
        table.add_entity(&Entity::new("partition", "1")).await.unwrap();

        let actions = vec![TransactionAction::new(
            ActionType::Delete,
            r#"{"PartitionKey":"partition","RowKey":"1"}"#,
        )];
        let resp = table.submit_transaction(&actions).await.unwrap();
        assert_eq!(resp.sub_responses.len(), 1);
        assert_eq!(resp.sub_responses[0].status, StatusCode::NO_CONTENT);

        match table.get_entity("partition", "1").await {
            Err(TableError::Service { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_transaction_sends_nothing() {
        // Unroutable endpoint: any network call would fail with a transport error.
        let service = TableServiceClient::new("http://127.0.0.1:9", credential()).unwrap();
        let table = service.table_client("t");
        assert!(matches!(
            table.submit_transaction(&[]).await,
            Err(TableError::EmptyTransaction)
        ));
    }

    #[tokio::test]
    async fn test_entity_crud() {
        let table = table("crud").await;
        let entity = Entity::new("p", "r")
            .with("Name", "first".to_string())
            .with("Count", 1i32)
            .with("Big", 1i64 << 40);

        let created = table.add_entity(&entity).await.unwrap();
        assert!(created.etag.is_some());
        assert!(matches!(
            table.add_entity(&entity).await,
            Err(TableError::Service { status: 409, .. })
        ));

        let fetched = table.get_entity("p", "r").await.unwrap();
        assert_eq!(fetched.entity.get("Name"), entity.get("Name"));
        assert_eq!(fetched.entity.get("Big"), entity.get("Big"));
        assert_eq!(fetched.etag, created.etag);

        let merge = Entity::new("p", "r").with("Extra", true);
        table
            .update_entity(&merge, UpdateMode::Merge, None)
            .await
            .unwrap();
        let merged = table.get_entity("p", "r").await.unwrap().entity;
        assert!(merged.get("Name").is_some());
        assert!(merged.get("Extra").is_some());

        table
            .update_entity(&merge, UpdateMode::Replace, None)
            .await
            .unwrap();
        let replaced = table.get_entity("p", "r").await.unwrap();
        assert!(replaced.entity.get("Name").is_none());

        // Stale ETag.
        assert!(matches!(
            table
                .update_entity(&merge, UpdateMode::Merge, created.etag.as_deref())
                .await,
            Err(TableError::Service { status: 412, .. })
        ));

        // Update of a missing entity does not insert.
        assert!(matches!(
            table
                .update_entity(&Entity::new("p", "missing"), UpdateMode::Merge, None)
                .await,
            Err(TableError::Service { status: 404, .. })
        ));
        table
            .upsert_entity(&Entity::new("p", "missing"), UpdateMode::Merge)
            .await
            .unwrap();

        table
            .delete_entity("p", "r", replaced.etag.as_deref())
            .await
            .unwrap();
        table.delete_entity("p", "missing", None).await.unwrap();
        assert!(matches!(
            table.delete_entity("p", "r", None).await,
            Err(TableError::Service { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_keys_with_quotes_and_spaces() {
        let table = table("escaping").await;
        let entity = Entity::new("o'brien", "row with spaces/and#hash");
        table.add_entity(&entity).await.unwrap();
        let fetched = table
            .get_entity("o'brien", "row with spaces/and#hash")
            .await
            .unwrap();
        assert_eq!(fetched.entity.row_key(), Some("row with spaces/and#hash"));
    }

    #[tokio::test]
    async fn test_entity_paging() {
        let table = table("paging").await;
        let actions: Vec<_> = (0..7).map(|i| add(&format!("{i:02}"))).collect();
        table.submit_transaction(&actions).await.unwrap();

        let mut pager = table.list_entities(ListEntitiesOptions {
            top: Some(3),
            ..Default::default()
        });
        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().await.unwrap() {
            sizes.push(page.entities.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_table_management() {
        let endpoint = start_emulator(true).await;
        let service = TableServiceClient::new(&endpoint, credential()).unwrap();
        service.create_table("alpha").await.unwrap();
        service.create_table("beta").await.unwrap();
        assert!(matches!(
            service.create_table("alpha").await,
            Err(TableError::Service { status: 409, .. })
        ));

        let mut names = service.list_tables(None).collect_all().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

        service.delete_table("alpha").await.unwrap();
        let names = service.list_tables(None).collect_all().await.unwrap();
        assert_eq!(names, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn test_access_policy_round_trip() {
        use crate::acl::AccessPolicy;
        use chrono::{TimeZone, Utc};

        let table = table("guarded").await;
        assert!(table.get_access_policy().await.unwrap().is_empty());

        let policies = vec![
            SignedIdentifier::new(
                "readers",
                AccessPolicy {
                    start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                    expiry: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
                    permission: Some("r".to_string()),
                },
            ),
            SignedIdentifier::new(
                "writers",
                AccessPolicy {
                    permission: Some("raud".to_string()),
                    ..AccessPolicy::default()
                },
            ),
        ];
        table.set_access_policy(&policies).await.unwrap();
        assert_eq!(table.get_access_policy().await.unwrap(), policies);

        table.set_access_policy(&[]).await.unwrap();
        assert!(table.get_access_policy().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_access_policy_errors() {
        use crate::acl::AccessPolicy;

        let table = table("limited").await;
        let six: Vec<_> = (0..6)
            .map(|i| SignedIdentifier::new(format!("p{i}"), AccessPolicy::default()))
            .collect();
        assert!(matches!(
            table.set_access_policy(&six).await,
            Err(TableError::InvalidArgument { .. })
        ));

        let missing = table.service.table_client("missing");
        match missing.get_access_policy().await {
            Err(TableError::Service { status, code, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(code.as_deref(), Some("TableNotFound"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let endpoint = start_emulator(true).await;
        let wrong = SharedKeyCredential::new(DEV_ACCOUNT_NAME, "d3Jvbmcga2V5").unwrap();
        let service = TableServiceClient::new(&endpoint, wrong).unwrap();
        match service.create_table("nope").await {
            Err(TableError::Service { status, code, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(code.as_deref(), Some("AuthenticationFailed"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_from_connection_string_and_url() {
        let endpoint = start_emulator(false).await;
        let service = TableServiceClient::from_connection_string(&format!(
            "TableEndpoint={endpoint}/;AccountName={DEV_ACCOUNT_NAME};AccountKey={DEV_ACCOUNT_KEY}"
        ))
        .unwrap();
        assert_eq!(service.endpoint(), endpoint);
        service.create_table("viaconn").await.unwrap();

        let table = TableClient::from_url(&format!("{endpoint}/viaconn"), None).unwrap();
        assert_eq!(table.table_name(), "viaconn");
        assert!(!table.is_cosmos());
        table.add_entity(&Entity::new("p", "r")).await.unwrap();
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            endpoint: Some("https://acct.table.core.windows.net/".to_string()),
            account: Some("acct".to_string()),
            account_key: Some(DEV_ACCOUNT_KEY.to_string()),
            ..ClientConfig::default()
        };
        let service = TableServiceClient::from_config(&config).unwrap();
        assert_eq!(service.endpoint(), "https://acct.table.core.windows.net");

        let sas = ClientConfig {
            endpoint: Some("https://acct.table.cosmos.azure.com".to_string()),
            sas_token: Some("?sv=1&sig=x".to_string()),
            ..ClientConfig::default()
        };
        let table = TableServiceClient::from_config(&sas)
            .unwrap()
            .table_client("t");
        assert!(table.is_cosmos());

        assert!(matches!(
            TableServiceClient::from_config(&ClientConfig::default()),
            Err(TableError::Config { .. })
        ));
    }
}
