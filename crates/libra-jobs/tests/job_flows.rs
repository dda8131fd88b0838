use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use libra_adapters::{
    parse_volumes, CatalogSearch, DeliveryError, PushDelivery, PushMessage, SearchError,
};
use libra_core::{CatalogSource, NotificationKind, SearchHit};
use libra_jobs::{
    CatalogImportJob, JobKind, JobRun, JobRunner, LibraConfig, NotificationDispatchJob,
    QueryFailurePolicy, REMINDER_TITLE,
};
use libra_storage::{Document, DocumentStore, Filter, MemoryStore, StoreError};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::Notify;

struct FixtureSearch {
    pages: HashMap<String, Vec<SearchHit>>,
    failing: HashSet<String>,
}

impl FixtureSearch {
    fn new() -> Self {
        Self {
            pages: HashMap::new(),
            failing: HashSet::new(),
        }
    }

    fn with_page(mut self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.pages.insert(query.to_string(), hits);
        self
    }

    fn failing_on(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }
}

#[async_trait]
impl CatalogSearch for FixtureSearch {
    fn source(&self) -> CatalogSource {
        CatalogSource::GoogleBooks
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        if self.failing.contains(query) {
            return Err(SearchError::Http {
                status: 503,
                body: "backend unavailable".into(),
            });
        }
        Ok(self.pages.get(query).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct RecordingDelivery {
    sent: Mutex<Vec<(String, PushMessage)>>,
    rejected_tokens: HashSet<String>,
}

impl RecordingDelivery {
    fn rejecting(token: &str) -> Self {
        Self {
            rejected_tokens: HashSet::from([token.to_string()]),
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<(String, PushMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushDelivery for RecordingDelivery {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        if self.rejected_tokens.contains(token) {
            return Err(DeliveryError::Rejected {
                status: 404,
                body: "UNREGISTERED".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((token.to_string(), message.clone()));
        Ok(())
    }
}

fn fixture_hits(name: &str) -> Vec<SearchHit> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/google-books")
        .join(name);
    parse_volumes(&std::fs::read(path).expect("fixture")).expect("parse fixture")
}

fn hit(id: Option<&str>, title: &str, authors: &[&str]) -> SearchHit {
    SearchHit {
        id: id.map(ToString::to_string),
        title: Some(title.to_string()),
        authors: authors.iter().map(ToString::to_string).collect(),
        ..SearchHit::default()
    }
}

fn queries(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).single().unwrap()
}

fn due_in(days: i64) -> String {
    (now().date_naive() + Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

#[tokio::test]
async fn import_is_idempotent_across_runs() {
    let store = Arc::new(MemoryStore::new());
    let search = Arc::new(
        FixtureSearch::new().with_page("programming", fixture_hits("volumes_programming.json")),
    );
    let job = CatalogImportJob::new(store.clone(), search);

    let first = job.run(&queries(&["programming"])).await.unwrap();
    assert_eq!(first.added, 3);
    assert_eq!(first.queries[0].fetched, 3);

    let second = job.run(&queries(&["programming"])).await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.queries[0].duplicates, 3);
    assert_eq!(store.len("ebooks").await, 3);

    let stored = store.all("ebooks").await;
    let pragmatic = stored
        .iter()
        .find(|d| d.get_str("sourceId") == Some("zyTCAlFPjgYC"))
        .expect("pragmatic programmer stored");
    assert_eq!(pragmatic.get_str("author"), Some("Andrew Hunt, David Thomas"));
    assert_eq!(pragmatic.get_str("source"), Some("google_books"));
    assert!(pragmatic.get_str("createdAt").is_some());
}

#[tokio::test]
async fn source_id_match_wins_over_changed_title() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(
            "ebooks",
            "existing",
            json!({
                "title": "Old Title",
                "author": "Someone Else",
                "source": "google_books",
                "sourceId": "vol-7"
            }),
        )
        .await
        .unwrap();
    let search = Arc::new(
        FixtureSearch::new().with_page("rust", vec![hit(Some("vol-7"), "New Title", &["Author"])]),
    );

    let summary = CatalogImportJob::new(store.clone(), search)
        .run(&queries(&["rust"]))
        .await
        .unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.queries[0].duplicates, 1);
    assert_eq!(store.len("ebooks").await, 1);
}

#[tokio::test]
async fn records_without_source_id_dedup_on_title_and_author() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(
            "ebooks",
            "manual",
            json!({"title": "Lecture Notes", "author": "Prof A, Prof B", "source": "google_books"}),
        )
        .await
        .unwrap();
    let search = Arc::new(FixtureSearch::new().with_page(
        "notes",
        vec![
            hit(None, "Lecture Notes", &["Prof A", "Prof B"]),
            hit(None, "Lecture Notes", &["Prof B", "Prof A"]),
        ],
    ));

    let summary = CatalogImportJob::new(store.clone(), search)
        .run(&queries(&["notes"]))
        .await
        .unwrap();
    // Author order is part of the key, so the reordered list is a new record.
    assert_eq!(summary.added, 1);
    assert_eq!(summary.queries[0].duplicates, 1);
}

#[tokio::test]
async fn failed_query_is_isolated_by_default() {
    let store = Arc::new(MemoryStore::new());
    let search = Arc::new(
        FixtureSearch::new()
            .failing_on("flutter")
            .with_page("programming", vec![hit(Some("a"), "A", &["X"])])
            .with_page("computer science", vec![hit(Some("b"), "B", &["Y"])]),
    );

    let summary = CatalogImportJob::new(store.clone(), search)
        .run(&queries(&["programming", "flutter", "computer science"]))
        .await
        .unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(summary.failed_queries(), 1);
    assert!(!summary.all_failed());
    let flutter = &summary.queries[1];
    assert_eq!(flutter.query, "flutter");
    assert!(flutter.error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn abort_policy_stops_at_first_failed_query() {
    let store = Arc::new(MemoryStore::new());
    let search = Arc::new(
        FixtureSearch::new()
            .failing_on("flutter")
            .with_page("programming", vec![hit(Some("a"), "A", &["X"])])
            .with_page("computer science", vec![hit(Some("b"), "B", &["Y"])]),
    );

    let err = CatalogImportJob::new(store.clone(), search)
        .with_policy(QueryFailurePolicy::Abort)
        .run(&queries(&["programming", "flutter", "computer science"]))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("flutter"));
    assert_eq!(store.len("ebooks").await, 1);
}

#[tokio::test]
async fn every_query_failing_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let search = Arc::new(FixtureSearch::new().failing_on("a").failing_on("b"));
    let summary = CatalogImportJob::new(store, search)
        .run(&queries(&["a", "b"]))
        .await
        .unwrap();
    assert!(summary.all_failed());
    assert_eq!(summary.added, 0);
}

async fn seed_loan(store: &MemoryStore, id: &str, user: &str, title: &str, due: &str, status: &str) {
    store
        .put(
            "borrow_requests",
            id,
            json!({"userId": user, "bookTitle": title, "dueDate": due, "status": status}),
        )
        .await
        .unwrap();
}

async fn seed_user(store: &MemoryStore, id: &str, token: Option<&str>) {
    let fields = match token {
        Some(token) => json!({"fcmToken": token}),
        None => json!({"name": id}),
    };
    store.put("users", id, fields).await.unwrap();
}

#[tokio::test]
async fn reminder_reaches_borrower_two_days_before_due() {
    let store = Arc::new(MemoryStore::new());
    seed_loan(&store, "l1", "u1", "Dune", &due_in(2), "borrowed").await;
    seed_user(&store, "u1", Some("token-1")).await;
    let delivery = Arc::new(RecordingDelivery::default());

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.outcomes[0].kind, NotificationKind::Reminder);

    let sent = delivery.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "token-1");
    assert_eq!(sent[0].1.title, REMINDER_TITLE);
    assert_eq!(
        sent[0].1.body,
        "Your borrowed book \"Dune\" is due on Wed Oct 21 2026"
    );
}

#[tokio::test]
async fn accepted_loan_five_days_late_gets_overdue_notice() {
    let store = Arc::new(MemoryStore::new());
    seed_loan(&store, "l1", "u1", "Dune", &due_in(-5), "accepted").await;
    seed_user(&store, "u1", Some("token-1")).await;
    let delivery = Arc::new(RecordingDelivery::default());

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.outcomes[0].kind, NotificationKind::Overdue);
    assert!(delivery.sent()[0].1.body.contains("overdue by 5 day(s)"));
}

#[tokio::test]
async fn missing_push_token_does_not_block_other_recipients() {
    let store = Arc::new(MemoryStore::new());
    seed_loan(&store, "l1", "u1", "A", &due_in(0), "borrowed").await;
    seed_loan(&store, "l2", "u2", "B", &due_in(1), "borrowed").await;
    seed_loan(&store, "l3", "u3", "C", &due_in(-1), "accepted").await;
    seed_user(&store, "u1", Some("t1")).await;
    seed_user(&store, "u2", None).await;
    seed_user(&store, "u3", Some("t3")).await;
    let delivery = Arc::new(RecordingDelivery::default());

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.delivered, 2);
    let skipped = summary.outcomes.iter().find(|o| !o.delivered).unwrap();
    assert_eq!(skipped.borrower_id, "u2");
    assert_eq!(skipped.reason.as_deref(), Some("borrower has no push token"));
}

#[tokio::test]
async fn delivery_rejection_is_isolated_per_recipient() {
    let store = Arc::new(MemoryStore::new());
    seed_loan(&store, "l1", "u1", "A", &due_in(1), "borrowed").await;
    seed_loan(&store, "l2", "u2", "B", &due_in(2), "borrowed").await;
    seed_user(&store, "u1", Some("stale")).await;
    seed_user(&store, "u2", Some("fresh")).await;
    let delivery = Arc::new(RecordingDelivery::rejecting("stale"));

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.delivered, 1);
    assert_eq!(delivery.sent()[0].0, "fresh");
    assert!(summary.outcomes[0].reason.as_deref().unwrap().contains("404"));
}

#[tokio::test]
async fn inactive_far_off_and_malformed_loans_are_not_notified() {
    let store = Arc::new(MemoryStore::new());
    seed_loan(&store, "l1", "u1", "A", &due_in(1), "returned").await;
    seed_loan(&store, "l2", "u1", "B", &due_in(3), "borrowed").await;
    seed_loan(&store, "l3", "u1", "", &due_in(0), "borrowed").await;
    store
        .put("borrow_requests", "l4", json!({"userId": "u1", "bookTitle": "D", "status": "borrowed"}))
        .await
        .unwrap();
    seed_user(&store, "u1", Some("t1")).await;
    let delivery = Arc::new(RecordingDelivery::default());

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.malformed, 2);
    assert_eq!(summary.attempted, 0);
    assert!(delivery.sent().is_empty());
}

#[tokio::test]
async fn no_active_loans_is_a_clean_run() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(RecordingDelivery::default());
    let summary = NotificationDispatchJob::new(store, delivery)
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.delivered, 0);
    assert!(summary.outcomes.is_empty());
}

fn runner_config(log_dir: &Path) -> LibraConfig {
    let mut config = LibraConfig::from_lookup(|key| match key {
        "DATABASE_URL" => Some("postgres://unused".to_string()),
        _ => None,
    })
    .unwrap();
    config.log_dir = log_dir.to_path_buf();
    config
}

#[tokio::test]
async fn runner_skips_jobs_whose_flag_is_off_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .put("schedules", "import_ebooks", json!({"monthly": false}))
        .await
        .unwrap();
    let search = Arc::new(
        FixtureSearch::new().with_page("programming", vec![hit(Some("a"), "A", &["X"])]),
    );
    let runner = JobRunner::new(runner_config(dir.path()), store.clone(), search);

    let skipped = runner
        .run_import(&queries(&["programming"]), false)
        .await
        .unwrap();
    assert!(matches!(skipped, JobRun::Skipped { job: JobKind::CatalogImport, .. }));
    assert_eq!(store.len("ebooks").await, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let forced = runner
        .run_import(&queries(&["programming"]), true)
        .await
        .unwrap();
    let JobRun::Completed { summary, log_path, .. } = forced else {
        panic!("forced run should complete");
    };
    assert_eq!(summary.added, 1);
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("catalog import finished"));
}

#[tokio::test]
async fn runner_runs_notifications_when_daily_flag_is_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .put("schedules", "due_notifications", json!({"daily": true}))
        .await
        .unwrap();
    seed_loan(&store, "l1", "u1", "Dune", &due_in(2), "borrowed").await;
    seed_user(&store, "u1", Some("token-1")).await;
    let delivery = Arc::new(RecordingDelivery::default());
    let runner = JobRunner::new(
        runner_config(dir.path()),
        store.clone() as Arc<dyn DocumentStore>,
        Arc::new(FixtureSearch::new()),
    )
    .with_delivery(delivery.clone());

    let run = runner.run_notifications(now(), false).await.unwrap();
    let JobRun::Completed { summary, .. } = run else {
        panic!("enabled run should complete");
    };
    assert_eq!(summary.delivered, 1);
    assert_eq!(delivery.sent().len(), 1);
}

#[tokio::test]
async fn notifications_without_delivery_fail_setup() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(
        runner_config(dir.path()),
        Arc::new(MemoryStore::new()),
        Arc::new(FixtureSearch::new()),
    );
    let err = runner.run_notifications(now(), true).await.unwrap_err();
    assert!(err.to_string().contains("push delivery is not configured"));
}

/// Holds every search open until released, counting calls.
#[derive(Default)]
struct GatedSearch {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl CatalogSearch for GatedSearch {
    fn source(&self) -> CatalogSource {
        CatalogSource::GoogleBooks
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![hit(Some("gated-1"), query, &["X"])])
    }
}

#[tokio::test]
async fn overlapping_scheduled_tick_is_skipped_per_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .put("schedules", "import_ebooks", json!({"monthly": true}))
        .await
        .unwrap();
    store
        .put("schedules", "due_notifications", json!({"daily": true}))
        .await
        .unwrap();
    let tomorrow = (Utc::now().date_naive() + Duration::days(1))
        .format("%Y-%m-%d")
        .to_string();
    seed_loan(&store, "l1", "u1", "Dune", &tomorrow, "borrowed").await;
    seed_user(&store, "u1", Some("token-1")).await;

    let search = Arc::new(GatedSearch::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let mut config = runner_config(dir.path());
    config.import_queries = queries(&["programming"]);
    let runner = Arc::new(
        JobRunner::new(config, store.clone(), search.clone()).with_delivery(delivery.clone()),
    );

    let first = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run_scheduled(JobKind::CatalogImport).await }
    });
    search.entered.notified().await;

    runner.run_scheduled(JobKind::CatalogImport).await;
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);

    runner.run_scheduled(JobKind::DueNotifications).await;
    assert_eq!(delivery.sent().len(), 1);

    search.release.notify_one();
    first.await.unwrap();
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.len("ebooks").await, 1);
}

/// Delegates to a `MemoryStore` but fails user lookups for one borrower.
struct FlakyUserLookup {
    inner: Arc<MemoryStore>,
    failing_user: &'static str,
}

#[async_trait]
impl DocumentStore for FlakyUserLookup {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        self.inner.query(collection, filters, limit).await
    }

    async fn insert(
        &self,
        collection: &str,
        fields: JsonMap<String, JsonValue>,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        self.inner.insert(collection, fields, server_timestamp).await
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        if collection == "users" && id == self.failing_user {
            return Err(StoreError::NotAnObject {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.inner.get_by_id(collection, id).await
    }
}

#[tokio::test]
async fn borrower_lookup_error_only_fails_that_recipient() {
    let inner = Arc::new(MemoryStore::new());
    seed_loan(&inner, "l1", "u1", "A", &due_in(0), "borrowed").await;
    seed_loan(&inner, "l2", "u2", "B", &due_in(1), "accepted").await;
    seed_user(&inner, "u1", Some("t1")).await;
    seed_user(&inner, "u2", Some("t2")).await;
    let store = Arc::new(FlakyUserLookup {
        inner,
        failing_user: "u1",
    });
    let delivery = Arc::new(RecordingDelivery::default());

    let summary = NotificationDispatchJob::new(store, delivery.clone())
        .run(now())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.delivered, 1);
    let failed = &summary.outcomes[0];
    assert_eq!(failed.borrower_id, "u1");
    assert!(!failed.delivered);
    assert!(failed
        .reason
        .as_deref()
        .unwrap()
        .starts_with("borrower lookup failed"));
    assert_eq!(delivery.sent()[0].0, "t2");
}
