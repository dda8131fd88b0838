//! External capability contracts (catalog search, push delivery) and their
//! Google Books / Firebase Cloud Messaging implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use libra_core::{CatalogSource, SearchHit};
use libra_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "libra-adapters";

pub const GOOGLE_BOOKS_VOLUMES_URL: &str = "https://www.googleapis.com/books/v1/volumes";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
pub const DEFAULT_PAGE_SIZE: u32 = 12;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search API returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("search request failed: {0}")]
    Transport(String),
    #[error("invalid search response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<FetchError> for SearchError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => SearchError::Http { status, body },
            FetchError::Request(err) => SearchError::Transport(err.to_string()),
        }
    }
}

#[async_trait]
pub trait CatalogSearch: Send + Sync {
    fn source(&self) -> CatalogSource;

    /// Returns one bounded page of hits for `query`, in API order.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct GoogleBooksConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
}

impl Default for GoogleBooksConfig {
    fn default() -> Self {
        Self {
            base_url: GOOGLE_BOOKS_VOLUMES_URL.to_string(),
            api_key: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

pub struct GoogleBooksSearch {
    http: Arc<HttpFetcher>,
    config: GoogleBooksConfig,
}

impl GoogleBooksSearch {
    pub fn new(http: Arc<HttpFetcher>, config: GoogleBooksConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl CatalogSearch for GoogleBooksSearch {
    fn source(&self) -> CatalogSource {
        CatalogSource::GoogleBooks
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let page_size = self.config.page_size.to_string();
        let mut params = vec![("q", query), ("maxResults", page_size.as_str())];
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            params.push(("key", key));
        }
        let resp = self.http.get(&self.config.base_url, &params).await?;
        let hits = parse_volumes(&resp.body)?;
        debug!(query, hits = hits.len(), "google books search");
        Ok(hits)
    }
}

#[derive(Debug, Deserialize)]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    id: Option<String>,
    #[serde(default)]
    volume_info: VolumeInfo,
    #[serde(default)]
    access_info: AccessInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    preview_link: Option<String>,
    image_links: Option<ImageLinks>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageLinks {
    thumbnail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessInfo {
    web_reader_link: Option<String>,
}

/// Parses a Google Books `volumes` response body. A body without `items`
/// means no results.
pub fn parse_volumes(body: &[u8]) -> Result<Vec<SearchHit>, SearchError> {
    let response: VolumesResponse = serde_json::from_slice(body)?;
    Ok(response
        .items
        .into_iter()
        .map(|volume| SearchHit {
            id: volume.id,
            title: volume.volume_info.title,
            authors: volume.volume_info.authors,
            thumbnail_url: volume.volume_info.image_links.and_then(|l| l.thumbnail),
            preview_link: volume.volume_info.preview_link,
            web_reader_link: volume.access_info.web_reader_link,
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AndroidPriority {
    Normal,
    High,
}

/// Per-platform delivery hints attached to every push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformHints {
    pub android_priority: AndroidPriority,
    pub android_icon: Option<String>,
    pub android_color: Option<String>,
    pub apns_priority: String,
}

impl Default for PlatformHints {
    fn default() -> Self {
        Self {
            android_priority: AndroidPriority::High,
            android_icon: Some("ic_launcher".to_string()),
            android_color: Some("#3B2715".to_string()),
            apns_priority: "10".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub hints: PlatformHints,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("push authorization failed: {0}")]
    Auth(String),
    #[error("push rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("push transport error: {0}")]
    Transport(String),
}

impl From<FetchError> for DeliveryError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => DeliveryError::Rejected { status, body },
            FetchError::Request(err) => DeliveryError::Transport(err.to_string()),
        }
    }
}

#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError>;
}

/// Service-account identity used to mint FCM access tokens.
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccount {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing service account {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Firebase Cloud Messaging HTTP v1 client.
pub struct FcmDelivery {
    http: Arc<HttpFetcher>,
    account: ServiceAccount,
    send_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl FcmDelivery {
    pub fn new(http: Arc<HttpFetcher>, account: ServiceAccount) -> Self {
        let send_url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            account.project_id
        );
        Self {
            http,
            account,
            send_url,
            token: Mutex::new(None),
        }
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, DeliveryError> {
        let claims = TokenClaims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: &self.account.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.account.private_key_id.clone();
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(|e| DeliveryError::Auth(format!("invalid private key: {e}")))?;
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| DeliveryError::Auth(format!("signing assertion: {e}")))
    }

    async fn access_token(&self) -> Result<String, DeliveryError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at - Duration::seconds(60) > now) {
            return Ok(token.access_token.clone());
        }

        let assertion = self.signed_assertion(now)?;
        let resp = self
            .http
            .post_form(
                &self.account.token_uri,
                &[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ],
            )
            .await
            .map_err(|e| DeliveryError::Auth(e.to_string()))?;
        let token: TokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| DeliveryError::Auth(format!("invalid token response: {e}")))?;

        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: now + Duration::seconds(token.expires_in),
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl PushDelivery for FcmDelivery {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        let access_token = self.access_token().await?;
        let payload = fcm_message_payload(token, message);
        self.http
            .post_json(&self.send_url, Some(&access_token), &payload)
            .await?;
        Ok(())
    }
}

/// Builds the FCM v1 `messages:send` request body.
pub fn fcm_message_payload(token: &str, message: &PushMessage) -> JsonValue {
    let mut android_notification = serde_json::Map::new();
    if let Some(icon) = &message.hints.android_icon {
        android_notification.insert("icon".into(), json!(icon));
    }
    if let Some(color) = &message.hints.android_color {
        android_notification.insert("color".into(), json!(color));
    }
    json!({
        "message": {
            "token": token,
            "notification": {
                "title": message.title,
                "body": message.body,
            },
            "android": {
                "priority": message.hints.android_priority,
                "notification": android_notification,
            },
            "apns": {
                "headers": { "apns-priority": message.hints.apns_priority },
            },
        }
    })
}
