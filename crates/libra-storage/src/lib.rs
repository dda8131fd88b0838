//! Document store backends + HTTP fetch utilities for the LibraEase jobs.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "libra-storage";

/// A stored document: generated id plus its JSON fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: JsonMap<String, JsonValue>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(JsonValue::as_str)
    }
}

/// Equality predicates understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: JsonValue },
    In { field: String, values: Vec<JsonValue> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn one_of<V: Into<JsonValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, fields: &JsonMap<String, JsonValue>) -> bool {
        match self {
            Filter::Eq { field, value } => fields.get(field) == Some(value),
            Filter::In { field, values } => fields
                .get(field)
                .map_or(false, |actual| values.contains(actual)),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document {collection}/{id} is not a JSON object")]
    NotAnObject { collection: String, id: String },
}

/// Document-collection capability shared by the jobs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns documents of `collection` matching every filter, oldest first.
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Inserts a new document and returns its generated id. When
    /// `server_timestamp` names a field, the store sets it to the insertion time.
    async fn insert(
        &self,
        collection: &str,
        fields: JsonMap<String, JsonValue>,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;
}

/// Process-local store keeping documents in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a document under a caller-chosen id, replacing any previous one.
    pub async fn put(&self, collection: &str, id: &str, fields: JsonValue) -> Result<(), StoreError> {
        let JsonValue::Object(fields) = fields else {
            return Err(StoreError::NotAnObject {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let doc = Document {
            id: id.to_string(),
            fields,
        };
        match docs.iter_mut().find(|d| d.id == id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }

    pub async fn all(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|doc| filters.iter().all(|f| f.matches(&doc.fields)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        collection: &str,
        mut fields: JsonMap<String, JsonValue>,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        if let Some(field) = server_timestamp {
            fields.insert(field.to_string(), JsonValue::String(Utc::now().to_rfc3339()));
        }
        let id = Uuid::new_v4().to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(Document {
                id: id.clone(),
                fields,
            });
        Ok(id)
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned()))
    }
}

/// Postgres backend: one `documents` table with JSONB fields per row.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to document database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, StoreError> {
        let id: String = row.try_get("id")?;
        let Json(fields): Json<JsonMap<String, JsonValue>> = row.try_get("fields")?;
        Ok(Document { id, fields })
    }
}

/// Compiles filters into a `documents` select. Returns `None` when an `In`
/// filter has no values, since nothing can match.
fn build_query(
    collection: &str,
    filters: &[Filter],
    limit: Option<usize>,
) -> Option<QueryBuilder<'static, Postgres>> {
    let mut qb: QueryBuilder<'static, Postgres> =
        QueryBuilder::new("SELECT id, fields FROM documents WHERE collection = ");
    qb.push_bind(collection.to_string());

    for filter in filters {
        match filter {
            Filter::Eq { field, value } => {
                qb.push(" AND fields -> ");
                qb.push_bind(field.clone());
                qb.push(" = ");
                qb.push_bind(Json(value.clone()));
            }
            Filter::In { field, values } => {
                if values.is_empty() {
                    return None;
                }
                qb.push(" AND fields -> ");
                qb.push_bind(field.clone());
                qb.push(" IN (");
                let mut separated = qb.separated(", ");
                for value in values {
                    separated.push_bind(Json(value.clone()));
                }
                separated.push_unseparated(")");
            }
        }
    }

    qb.push(" ORDER BY created_at, id");
    if let Some(limit) = limit {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    Some(qb)
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let Some(mut qb) = build_query(collection, filters, limit) else {
            return Ok(Vec::new());
        };
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .instrument(info_span!("store_query", collection))
            .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn insert(
        &self,
        collection: &str,
        fields: JsonMap<String, JsonValue>,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let query = match server_timestamp {
            Some(field) => sqlx::query(
                "INSERT INTO documents (collection, id, fields) \
                 VALUES ($1, $2, $3::jsonb || jsonb_build_object($4::text, now()))",
            )
            .bind(collection)
            .bind(&id)
            .bind(Json(fields))
            .bind(field),
            None => sqlx::query("INSERT INTO documents (collection, id, fields) VALUES ($1, $2, $3)")
                .bind(collection)
                .bind(&id)
                .bind(Json(fields)),
        };
        query.execute(&self.pool).await?;
        debug!(collection, %id, "inserted document");
        Ok(id)
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT id, fields FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Google APIs signal quota exhaustion with 429 and transient outages with
/// 5xx; every other failure status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubles from `base_delay` per attempt, never beyond `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// Thin reqwest wrapper. GETs retry transient failures with backoff; POSTs
/// are sent exactly once.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", url);
        async {
            let mut attempt = 0;
            loop {
                match self.client.get(url).query(query).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if !status.is_success()
                            && classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Self::into_fetched(resp).await;
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .instrument(info_span!("http_post_form", url))
            .await?;
        Self::into_fetched(resp).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .instrument(info_span!("http_post_json", url))
            .await?;
        Self::into_fetched(resp).await
    }

    async fn into_fetched(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
