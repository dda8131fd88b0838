//! Core domain model for the LibraEase catalog and loan jobs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "libra-core";

/// Document collection holding imported catalog records.
pub const EBOOKS_COLLECTION: &str = "ebooks";
/// Document collection holding loan (borrow request) records.
pub const LOANS_COLLECTION: &str = "borrow_requests";
/// Document collection holding borrower profiles.
pub const USERS_COLLECTION: &str = "users";
/// Document collection holding operator-controlled schedule flags.
pub const SCHEDULES_COLLECTION: &str = "schedules";

/// Separator used when collapsing an author list into the stored `author` field.
pub const AUTHOR_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogSource {
    #[serde(rename = "google_books")]
    GoogleBooks,
}

impl CatalogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogSource::GoogleBooks => "google_books",
        }
    }
}

/// One hit returned by an external catalog search, before any dedup decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchHit {
    pub id: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub preview_link: Option<String>,
    pub web_reader_link: Option<String>,
}

/// Catalog entry as persisted in the `ebooks` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub title: String,
    pub author: String,
    #[serde(rename = "imageUrl")]
    pub cover_image_url: Option<String>,
    #[serde(rename = "pdfUrl")]
    pub preview_url: Option<String>,
    pub source: CatalogSource,
    #[serde(rename = "sourceId")]
    pub source_id: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CatalogRecord {
    /// Builds the record a search hit would be stored as. `created_at` stays
    /// empty; the store stamps it at insertion time.
    pub fn from_search_hit(source: CatalogSource, hit: &SearchHit) -> Self {
        Self {
            title: hit.title.clone().unwrap_or_default(),
            author: hit.authors.join(AUTHOR_SEPARATOR),
            cover_image_url: non_empty(hit.thumbnail_url.as_deref()),
            preview_url: non_empty(hit.web_reader_link.as_deref())
                .or_else(|| non_empty(hit.preview_link.as_deref())),
            source,
            source_id: non_empty(hit.id.as_deref()),
            created_at: None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(ToString::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Pending,
    Accepted,
    Borrowed,
    Returned,
    Rejected,
    #[serde(untagged)]
    Other(String),
}

impl LoanStatus {
    /// Statuses whose loans are scanned for due-date notices.
    pub const ACTIVE: [LoanStatus; 2] = [LoanStatus::Accepted, LoanStatus::Borrowed];

    pub fn as_str(&self) -> &str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Accepted => "accepted",
            LoanStatus::Borrowed => "borrowed",
            LoanStatus::Returned => "returned",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Other(other) => other,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LoanStatus::Accepted | LoanStatus::Borrowed)
    }
}

/// Loan as read from the lending subsystem. Required fields are optional here
/// because stored loans may be incomplete; incomplete loans are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: String,
    pub borrower_id: Option<String>,
    pub book_title: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub status: LoanStatus,
}

impl LoanRecord {
    /// Names of the required fields this loan lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.due_date.is_none() {
            missing.push("dueDate");
        }
        if self.borrower_id.as_deref().map_or(true, str::is_empty) {
            missing.push("userId");
        }
        if self.book_title.as_deref().map_or(true, str::is_empty) {
            missing.push("bookTitle");
        }
        missing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrower {
    pub id: String,
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Reminder,
    Overdue,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Reminder => "reminder",
            NotificationKind::Overdue => "overdue",
        }
    }
}

/// Per-loan result of a notification run. Reported, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOutcome {
    pub loan_id: String,
    pub borrower_id: String,
    pub kind: NotificationKind,
    pub delivered: bool,
    pub reason: Option<String>,
}

/// Operator-controlled enablement flag for one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFlag {
    pub job_name: String,
    pub enabled: bool,
}
