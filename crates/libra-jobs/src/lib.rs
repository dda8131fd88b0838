//! Catalog import + due-date notification jobs, their schedule gate, per-run
//! logging and the cron scheduler that drives them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use libra_adapters::{
    CatalogSearch, PlatformHints, PushDelivery, PushMessage, ServiceAccount, DEFAULT_PAGE_SIZE,
    GOOGLE_BOOKS_VOLUMES_URL, GOOGLE_TOKEN_URI,
};
use libra_core::{
    Borrower, CatalogRecord, LoanRecord, LoanStatus, NotificationKind, NotificationOutcome,
    ScheduleFlag, EBOOKS_COLLECTION, LOANS_COLLECTION, SCHEDULES_COLLECTION, USERS_COLLECTION,
};
use libra_storage::{Document, DocumentStore, Filter, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, warn, Dispatch, Instrument};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "libra-jobs";

pub const REMINDER_TITLE: &str = "LibraEase Reminder";
pub const DEFAULT_IMPORT_QUERIES: [&str; 3] = ["programming", "flutter", "computer science"];
pub const DEFAULT_REMINDER_WINDOW_DAYS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CatalogImport,
    DueNotifications,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::CatalogImport, JobKind::DueNotifications];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::CatalogImport => "catalog_import",
            JobKind::DueNotifications => "due_notifications",
        }
    }

    /// Document id of this job's flag in the `schedules` collection.
    pub fn schedule_key(&self) -> &'static str {
        match self {
            JobKind::CatalogImport => "import_ebooks",
            JobKind::DueNotifications => "due_notifications",
        }
    }

    /// Boolean field inside the schedule document that enables the job.
    pub fn flag_field(&self) -> &'static str {
        match self {
            JobKind::CatalogImport => "monthly",
            JobKind::DueNotifications => "daily",
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing required configuration: {}", .fields.join(", "))]
    Missing { fields: Vec<String> },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("unusable service account credentials: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFailurePolicy {
    /// Record the failed query and keep importing the rest.
    #[default]
    Isolate,
    /// Abort the whole run on the first failed query.
    Abort,
}

impl FromStr for QueryFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected `isolate` or `abort`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LibraConfig {
    pub database_url: String,
    pub google_books_base_url: String,
    pub google_books_api_key: Option<String>,
    pub import_queries: Vec<String>,
    pub import_page_size: u32,
    pub query_failure_policy: QueryFailurePolicy,
    pub reminder_window_days: i64,
    pub log_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub import_cron: String,
    pub notify_cron: String,
}

impl LibraConfig {
    pub fn from_env() -> Result<Self, SetupError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Every missing required key is
    /// reported in one error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SetupError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing = missing_keys(&get, &REQUIRED_KEYS);
        if !missing.is_empty() {
            return Err(SetupError::Missing { fields: missing });
        }

        let import_queries = match get("LIBRA_IMPORT_QUERIES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => DEFAULT_IMPORT_QUERIES.iter().map(ToString::to_string).collect(),
        };

        let reminder_window_days: i64 =
            parse_or(&get, "LIBRA_REMINDER_WINDOW_DAYS", DEFAULT_REMINDER_WINDOW_DAYS)?;
        if reminder_window_days < 0 {
            return Err(SetupError::Invalid {
                field: "LIBRA_REMINDER_WINDOW_DAYS".into(),
                reason: "must not be negative".into(),
            });
        }

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_default(),
            google_books_base_url: get("GOOGLE_BOOKS_BASE_URL")
                .unwrap_or_else(|| GOOGLE_BOOKS_VOLUMES_URL.to_string()),
            google_books_api_key: get("GOOGLE_BOOKS_API_KEY"),
            import_queries,
            import_page_size: parse_or(&get, "LIBRA_IMPORT_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            query_failure_policy: parse_or(
                &get,
                "LIBRA_IMPORT_ON_QUERY_ERROR",
                QueryFailurePolicy::default(),
            )?,
            reminder_window_days,
            log_dir: get("LIBRA_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            user_agent: get("LIBRA_USER_AGENT").unwrap_or_else(|| "libra-jobs/0.1".to_string()),
            http_timeout_secs: parse_or(&get, "LIBRA_HTTP_TIMEOUT_SECS", 20)?,
            scheduler_enabled: get("LIBRA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            import_cron: get("IMPORT_CRON").unwrap_or_else(|| "0 0 3 1 * *".to_string()),
            notify_cron: get("NOTIFY_CRON").unwrap_or_else(|| "0 0 8 * * *".to_string()),
        })
    }

    pub fn cron_for(&self, job: JobKind) -> &str {
        match job {
            JobKind::CatalogImport => &self.import_cron,
            JobKind::DueNotifications => &self.notify_cron,
        }
    }

    pub fn service_account_from_env() -> Result<ServiceAccount, SetupError> {
        service_account_from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_env_with_push() -> Result<(Self, ServiceAccount), SetupError> {
        Self::from_lookup_with_push(|key| std::env::var(key).ok())
    }

    /// Config plus push credentials for the jobs that deliver notifications.
    /// Missing keys of both are reported together, before anything connects.
    pub fn from_lookup_with_push(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, ServiceAccount), SetupError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = missing_keys(&get, &REQUIRED_KEYS);
        if get("GOOGLE_APPLICATION_CREDENTIALS").is_none() {
            missing.extend(missing_keys(&get, &SERVICE_ACCOUNT_KEYS));
        }
        if !missing.is_empty() {
            return Err(SetupError::Missing { fields: missing });
        }

        let config = Self::from_lookup(&lookup)?;
        let account = service_account_from_lookup(&lookup)?;
        Ok((config, account))
    }
}

const REQUIRED_KEYS: [&str; 1] = ["DATABASE_URL"];
const SERVICE_ACCOUNT_KEYS: [&str; 3] =
    ["FIREBASE_PROJECT_ID", "FIREBASE_CLIENT_EMAIL", "FIREBASE_PRIVATE_KEY"];

fn missing_keys(get: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .copied()
        .filter(|&key| get(key).is_none())
        .map(ToString::to_string)
        .collect()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, SetupError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| SetupError::Invalid {
            field: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Resolves push credentials from `GOOGLE_APPLICATION_CREDENTIALS` (a key file)
/// or from the individual `FIREBASE_*` variables.
pub fn service_account_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServiceAccount, SetupError> {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = get("GOOGLE_APPLICATION_CREDENTIALS") {
        return ServiceAccount::from_json_file(&path)
            .map_err(|e| SetupError::Credentials(format!("{e:#}")));
    }

    let missing = missing_keys(&get, &SERVICE_ACCOUNT_KEYS);
    if !missing.is_empty() {
        return Err(SetupError::Missing { fields: missing });
    }

    Ok(ServiceAccount {
        project_id: get("FIREBASE_PROJECT_ID").unwrap_or_default(),
        client_email: get("FIREBASE_CLIENT_EMAIL").unwrap_or_default(),
        private_key: get("FIREBASE_PRIVATE_KEY")
            .unwrap_or_default()
            .replace("\\n", "\n"),
        private_key_id: get("FIREBASE_PRIVATE_KEY_ID"),
        token_uri: get("FIREBASE_TOKEN_URI").unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Schedule gate
// ---------------------------------------------------------------------------

pub struct ScheduleGate {
    store: Arc<dyn DocumentStore>,
}

impl ScheduleGate {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn flag(&self, job: JobKind) -> Result<ScheduleFlag, StoreError> {
        let doc = self
            .store
            .get_by_id(SCHEDULES_COLLECTION, job.schedule_key())
            .await?;
        let enabled = doc
            .as_ref()
            .and_then(|d| d.get(job.flag_field()))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        Ok(ScheduleFlag {
            job_name: job.name().to_string(),
            enabled,
        })
    }

    /// Only a literal `true` enables the job; a missing document or field,
    /// `false`, or a non-boolean value all mean disabled.
    pub async fn is_enabled(&self, job: JobKind) -> Result<bool, StoreError> {
        Ok(self.flag(job).await?.enabled)
    }
}

// ---------------------------------------------------------------------------
// Catalog import
// ---------------------------------------------------------------------------

pub struct RecordMatcher;

impl RecordMatcher {
    /// Dedup key as store filters: (source, sourceId) when the id is known,
    /// otherwise (title, author).
    pub fn dedup_filters(record: &CatalogRecord) -> Vec<Filter> {
        match record.source_id.as_deref().filter(|id| !id.is_empty()) {
            Some(source_id) => vec![
                Filter::eq("source", record.source.as_str()),
                Filter::eq("sourceId", source_id),
            ],
            None => vec![
                Filter::eq("title", record.title.as_str()),
                Filter::eq("author", record.author.as_str()),
            ],
        }
    }

    pub async fn is_duplicate(
        record: &CatalogRecord,
        store: &dyn DocumentStore,
    ) -> Result<bool, StoreError> {
        let existing = store
            .query(EBOOKS_COLLECTION, &Self::dedup_filters(record), Some(1))
            .await?;
        Ok(!existing.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    pub query: String,
    pub fetched: usize,
    pub added: usize,
    pub duplicates: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub queries: Vec<QueryOutcome>,
}

impl ImportSummary {
    pub fn failed_queries(&self) -> usize {
        self.queries.iter().filter(|q| q.error.is_some()).count()
    }

    pub fn all_failed(&self) -> bool {
        !self.queries.is_empty() && self.failed_queries() == self.queries.len()
    }
}

pub struct CatalogImportJob {
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn CatalogSearch>,
    policy: QueryFailurePolicy,
}

impl CatalogImportJob {
    pub fn new(store: Arc<dyn DocumentStore>, search: Arc<dyn CatalogSearch>) -> Self {
        Self {
            store,
            search,
            policy: QueryFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: QueryFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run(&self, queries: &[String]) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        for query in queries {
            let mut outcome = QueryOutcome {
                query: query.clone(),
                ..Default::default()
            };
            let result = self
                .import_query(query, &mut outcome)
                .instrument(info_span!("import_query", query = %query))
                .await;
            summary.added += outcome.added;

            if let Err(err) = result {
                if self.policy == QueryFailurePolicy::Abort {
                    return Err(err.context(format!("importing query {query:?}")));
                }
                let reason = format!("{err:#}");
                error!(query = %query, error = %reason, added = outcome.added, "query failed; continuing with next query");
                outcome.error = Some(reason);
            } else {
                info!(
                    query = %query,
                    fetched = outcome.fetched,
                    added = outcome.added,
                    duplicates = outcome.duplicates,
                    "query imported"
                );
            }
            summary.queries.push(outcome);
        }

        Ok(summary)
    }

    async fn import_query(&self, query: &str, outcome: &mut QueryOutcome) -> Result<()> {
        let hits = self
            .search
            .search(query)
            .await
            .with_context(|| format!("searching {query:?}"))?;
        outcome.fetched = hits.len();

        for hit in &hits {
            let record = CatalogRecord::from_search_hit(self.search.source(), hit);
            if RecordMatcher::is_duplicate(&record, self.store.as_ref())
                .await
                .context("checking for an existing catalog record")?
            {
                outcome.duplicates += 1;
                continue;
            }
            self.insert(&record).await?;
            outcome.added += 1;
        }
        Ok(())
    }

    async fn insert(&self, record: &CatalogRecord) -> Result<()> {
        let JsonValue::Object(fields) =
            serde_json::to_value(record).context("serializing catalog record")?
        else {
            bail!("catalog record did not serialize to a JSON object");
        };
        let id = self
            .store
            .insert(EBOOKS_COLLECTION, fields, Some("createdAt"))
            .await
            .context("inserting catalog record")?;
        debug!(%id, title = %record.title, source_id = ?record.source_id, "catalog record added");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Due-date classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DueWindow {
    Reminder,
    Overdue,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueClassification {
    pub window: DueWindow,
    pub days_remaining: Option<i64>,
    pub message: Option<String>,
}

impl DueClassification {
    fn not_due(days_remaining: Option<i64>) -> Self {
        Self {
            window: DueWindow::NotDue,
            days_remaining,
            message: None,
        }
    }

    pub fn kind(&self) -> Option<NotificationKind> {
        match self.window {
            DueWindow::Reminder => Some(NotificationKind::Reminder),
            DueWindow::Overdue => Some(NotificationKind::Overdue),
            DueWindow::NotDue => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DueWindowClassifier {
    reminder_window_days: i64,
}

impl Default for DueWindowClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_REMINDER_WINDOW_DAYS)
    }
}

impl DueWindowClassifier {
    pub fn new(reminder_window_days: i64) -> Self {
        Self {
            reminder_window_days,
        }
    }

    /// Whole calendar days from today (UTC) until `due`; negative once overdue.
    pub fn days_remaining(due: NaiveDate, now: DateTime<Utc>) -> i64 {
        (due - now.date_naive()).num_days()
    }

    pub fn classify(&self, loan: &LoanRecord, now: DateTime<Utc>) -> DueClassification {
        let (Some(due), Some(title)) = (loan.due_date, loan.book_title.as_deref()) else {
            return DueClassification::not_due(None);
        };
        if loan.borrower_id.as_deref().map_or(true, str::is_empty) || title.is_empty() {
            return DueClassification::not_due(None);
        }

        let days = Self::days_remaining(due, now);
        if days < 0 {
            DueClassification {
                window: DueWindow::Overdue,
                days_remaining: Some(days),
                message: Some(format!(
                    "Your borrowed book \"{title}\" is overdue by {} day(s). Please return it on time to avoid late fees.",
                    days.abs()
                )),
            }
        } else if days <= self.reminder_window_days {
            DueClassification {
                window: DueWindow::Reminder,
                days_remaining: Some(days),
                message: Some(format!(
                    "Your borrowed book \"{title}\" is due on {}",
                    due.format("%a %b %d %Y")
                )),
            }
        } else {
            DueClassification::not_due(Some(days))
        }
    }
}

/// Maps a `borrow_requests` document onto a loan. Unparseable fields become
/// `None` so the loan is skipped rather than failing the batch.
pub fn loan_from_document(doc: &Document) -> LoanRecord {
    LoanRecord {
        id: doc.id.clone(),
        borrower_id: doc.get_str("userId").map(ToString::to_string),
        book_title: doc.get_str("bookTitle").map(ToString::to_string),
        due_date: doc.get("dueDate").and_then(parse_due_date),
        status: doc
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| LoanStatus::Other(String::new())),
    }
}

pub fn borrower_from_document(doc: &Document) -> Borrower {
    Borrower {
        id: doc.id.clone(),
        push_token: doc
            .get_str("fcmToken")
            .filter(|t| !t.trim().is_empty())
            .map(ToString::to_string),
    }
}

/// Accepts RFC 3339 timestamps, plain `YYYY-MM-DD` dates and exported
/// `{seconds, nanoseconds}` timestamp objects.
fn parse_due_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc).date_naive())
            .ok()
            .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        JsonValue::Object(map) => map
            .get("seconds")
            .or_else(|| map.get("_seconds"))
            .and_then(JsonValue::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.date_naive()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Notification dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub scanned: usize,
    pub malformed: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub outcomes: Vec<NotificationOutcome>,
}

#[derive(Debug, Error)]
enum RecipientError {
    #[error("borrower not found")]
    NotFound,
    #[error("borrower has no push token")]
    NoToken,
    #[error("borrower lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

pub struct NotificationDispatchJob {
    store: Arc<dyn DocumentStore>,
    delivery: Arc<dyn PushDelivery>,
    classifier: DueWindowClassifier,
    hints: PlatformHints,
}

impl NotificationDispatchJob {
    pub fn new(store: Arc<dyn DocumentStore>, delivery: Arc<dyn PushDelivery>) -> Self {
        Self {
            store,
            delivery,
            classifier: DueWindowClassifier::default(),
            hints: PlatformHints::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: DueWindowClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let active = Filter::one_of("status", LoanStatus::ACTIVE.iter().map(LoanStatus::as_str));
        let docs = self
            .store
            .query(LOANS_COLLECTION, &[active], None)
            .await
            .context("querying active loans")?;
        if docs.is_empty() {
            info!("no active loans found");
            return Ok(DispatchSummary::default());
        }

        let mut loans: Vec<LoanRecord> = docs.iter().map(loan_from_document).collect();
        loans.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));

        let mut summary = DispatchSummary {
            scanned: loans.len(),
            ..Default::default()
        };

        for loan in &loans {
            let missing = loan.missing_fields();
            if !missing.is_empty() {
                warn!(loan_id = %loan.id, missing = ?missing, "skipping malformed loan");
                summary.malformed += 1;
                continue;
            }

            let classification = self.classifier.classify(loan, now);
            let (Some(kind), Some(message)) = (classification.kind(), classification.message)
            else {
                continue;
            };
            let borrower_id = loan.borrower_id.as_deref().unwrap_or_default();

            summary.attempted += 1;
            let outcome = self.notify(&loan.id, borrower_id, kind, message).await;
            if outcome.delivered {
                summary.delivered += 1;
            }
            summary.outcomes.push(outcome);
        }

        info!(
            scanned = summary.scanned,
            malformed = summary.malformed,
            attempted = summary.attempted,
            delivered = summary.delivered,
            "notifications processed"
        );
        Ok(summary)
    }

    async fn notify(
        &self,
        loan_id: &str,
        borrower_id: &str,
        kind: NotificationKind,
        message: String,
    ) -> NotificationOutcome {
        let outcome = |delivered: bool, reason: Option<String>| NotificationOutcome {
            loan_id: loan_id.to_string(),
            borrower_id: borrower_id.to_string(),
            kind,
            delivered,
            reason,
        };

        let token = match self.resolve_push_token(borrower_id).await {
            Ok(token) => token,
            Err(err) => {
                warn!(loan_id, borrower_id, kind = kind.as_str(), error = %err, "recipient unresolved; skipping");
                return outcome(false, Some(err.to_string()));
            }
        };

        let push = PushMessage {
            title: REMINDER_TITLE.to_string(),
            body: message,
            hints: self.hints.clone(),
        };
        match self.delivery.send(&token, &push).await {
            Ok(()) => {
                info!(loan_id, borrower_id, kind = kind.as_str(), "notification sent");
                outcome(true, None)
            }
            Err(err) => {
                error!(loan_id, borrower_id, kind = kind.as_str(), error = %err, "notification delivery failed");
                outcome(false, Some(err.to_string()))
            }
        }
    }

    async fn resolve_push_token(&self, borrower_id: &str) -> Result<String, RecipientError> {
        let doc = self
            .store
            .get_by_id(USERS_COLLECTION, borrower_id)
            .await?
            .ok_or(RecipientError::NotFound)?;
        borrower_from_document(&doc)
            .push_token
            .ok_or(RecipientError::NoToken)
    }
}

// ---------------------------------------------------------------------------
// Per-run logging
// ---------------------------------------------------------------------------

/// Structured log scoped to one job invocation: console output plus a JSON
/// lines file, attached only to the futures run through [`RunLog::scope`].
pub struct RunLog {
    run_id: Uuid,
    path: PathBuf,
    dispatch: Dispatch,
}

impl RunLog {
    /// Opens a run log whose console output honours `RUST_LOG`.
    pub async fn open(log_dir: &Path, job: JobKind) -> Result<Self> {
        let console = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        Self::open_with_console_filter(log_dir, job, console).await
    }

    /// The file always records `info` and above regardless of `console`.
    pub async fn open_with_console_filter(
        log_dir: &Path,
        job: JobKind,
        console: EnvFilter,
    ) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .await
            .with_context(|| format!("creating {}", log_dir.display()))?;

        let run_id = Uuid::new_v4();
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let short_id = run_id.simple().to_string();
        let path = log_dir.join(format!("{}-{stamp}-{}.log", job.name(), &short_id[..8]));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening run log {}", path.display()))?
            .into_std()
            .await;

        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_filter(console))
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(StdMutex::new(file))
                    .with_filter(LevelFilter::INFO),
            );

        Ok(Self {
            run_id,
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        fut.with_subscriber(self.dispatch.clone()).await
    }

    /// Releases the log file and returns its path.
    pub fn close(self) -> PathBuf {
        let Self { path, dispatch, .. } = self;
        drop(dispatch);
        path
    }
}

// ---------------------------------------------------------------------------
// Runner + scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobRun<T> {
    Skipped {
        job: JobKind,
        reason: String,
    },
    Completed {
        job: JobKind,
        run_id: Uuid,
        log_path: PathBuf,
        summary: T,
    },
}

pub struct JobRunner {
    config: LibraConfig,
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn CatalogSearch>,
    delivery: Option<Arc<dyn PushDelivery>>,
    import_lock: Mutex<()>,
    notify_lock: Mutex<()>,
}

impl JobRunner {
    pub fn new(
        config: LibraConfig,
        store: Arc<dyn DocumentStore>,
        search: Arc<dyn CatalogSearch>,
    ) -> Self {
        Self {
            config,
            store,
            search,
            delivery: None,
            import_lock: Mutex::new(()),
            notify_lock: Mutex::new(()),
        }
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn PushDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn config(&self) -> &LibraConfig {
        &self.config
    }

    async fn gate_allows(&self, job: JobKind, force: bool) -> Result<Option<String>> {
        if force {
            return Ok(None);
        }
        let flag = ScheduleGate::new(self.store.clone())
            .flag(job)
            .await
            .with_context(|| format!("reading schedule flag for {}", job.name()))?;
        if flag.enabled {
            Ok(None)
        } else {
            Ok(Some(format!(
                "schedule flag {}/{}.{} is not enabled",
                SCHEDULES_COLLECTION,
                job.schedule_key(),
                job.flag_field()
            )))
        }
    }

    pub async fn run_import(&self, queries: &[String], force: bool) -> Result<JobRun<ImportSummary>> {
        let job = JobKind::CatalogImport;
        if let Some(reason) = self.gate_allows(job, force).await? {
            info!(job = job.name(), %reason, "job skipped");
            return Ok(JobRun::Skipped { job, reason });
        }

        let log = RunLog::open(&self.config.log_dir, job).await?;
        let run_id = log.run_id();
        let import = CatalogImportJob::new(self.store.clone(), self.search.clone())
            .with_policy(self.config.query_failure_policy);

        let result = log
            .scope(async {
                let span = info_span!("job_run", job = job.name(), %run_id);
                async {
                    info!(queries = queries.len(), policy = ?self.config.query_failure_policy, "catalog import started");
                    let result = import.run(queries).await;
                    match &result {
                        Ok(summary) => info!(
                            added = summary.added,
                            failed_queries = summary.failed_queries(),
                            "catalog import finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "catalog import aborted"),
                    }
                    result
                }
                .instrument(span)
                .await
            })
            .await;
        let log_path = log.close();

        Ok(JobRun::Completed {
            job,
            run_id,
            log_path,
            summary: result?,
        })
    }

    pub async fn run_notifications(
        &self,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<JobRun<DispatchSummary>> {
        let job = JobKind::DueNotifications;
        let Some(delivery) = self.delivery.clone() else {
            bail!("push delivery is not configured");
        };
        if let Some(reason) = self.gate_allows(job, force).await? {
            info!(job = job.name(), %reason, "job skipped");
            return Ok(JobRun::Skipped { job, reason });
        }

        let log = RunLog::open(&self.config.log_dir, job).await?;
        let run_id = log.run_id();
        let dispatch = NotificationDispatchJob::new(self.store.clone(), delivery)
            .with_classifier(DueWindowClassifier::new(self.config.reminder_window_days));

        let result = log
            .scope(async {
                let span = info_span!("job_run", job = job.name(), %run_id);
                async {
                    info!(now = %now, "due-date notifications started");
                    let result = dispatch.run(now).await;
                    if let Err(err) = &result {
                        error!(error = %format!("{err:#}"), "due-date notifications aborted");
                    }
                    result
                }
                .instrument(span)
                .await
            })
            .await;
        let log_path = log.close();

        Ok(JobRun::Completed {
            job,
            run_id,
            log_path,
            summary: result?,
        })
    }

    /// One scheduler tick: skipped when the same job is still running,
    /// otherwise gated and run. Errors are logged, never propagated.
    pub async fn run_scheduled(&self, job: JobKind) {
        let lock = match job {
            JobKind::CatalogImport => &self.import_lock,
            JobKind::DueNotifications => &self.notify_lock,
        };
        let Ok(_guard) = lock.try_lock() else {
            warn!(job = job.name(), "previous run still in progress; skipping tick");
            return;
        };

        let result = match job {
            JobKind::CatalogImport => self
                .run_import(&self.config.import_queries, false)
                .await
                .map(|run| matches!(run, JobRun::Skipped { .. })),
            JobKind::DueNotifications => self
                .run_notifications(Utc::now(), false)
                .await
                .map(|run| matches!(run, JobRun::Skipped { .. })),
        };
        match result {
            Ok(true) => debug!(job = job.name(), "scheduled tick skipped by schedule flag"),
            Ok(false) => info!(job = job.name(), "scheduled run completed"),
            Err(err) => error!(job = job.name(), error = %format!("{err:#}"), "scheduled run failed"),
        }
    }
}

pub async fn maybe_build_scheduler(runner: Arc<JobRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for kind in JobKind::ALL {
        let cron = runner.config.cron_for(kind).to_string();
        let runner = runner.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run_scheduled(kind).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = kind.name(), cron = %cron, "scheduled");
    }
    Ok(Some(sched))
}

/// Runs the scheduler until Ctrl-C.
pub async fn run_scheduler_until_shutdown(runner: Arc<JobRunner>) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(runner).await? else {
        bail!("scheduler is disabled; set LIBRA_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested; stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
