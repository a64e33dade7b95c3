use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Type};
use uuid::Uuid;

pub mod frequency;

pub use frequency::{Frequency, Period};

// Enums

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Privileges checked on the reporting index before a route runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Read,
    Write,
    Create,
    Delete,
}

impl Privilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::Write => "write",
            Privilege::Create => "create",
            Privilege::Delete => "delete",
        }
    }
}

// Structs

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportingTask {
    pub id: Uuid,
    pub dashboard_id: String,
    pub space: Option<String>,
    pub frequency: String,
    pub emails: String,
    pub print: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ReportingTask {
    /// Creates a task due at the start of the next period of `frequency`.
    pub fn new(
        dashboard_id: impl Into<String>,
        space: Option<String>,
        frequency: &Frequency,
        emails: impl Into<String>,
        print: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dashboard_id: dashboard_id.into(),
            space,
            frequency: frequency.as_str().to_string(),
            emails: emails.into(),
            print,
            next_run: frequency.start_of_next_period(now),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn frequency(&self) -> Frequency {
        Frequency::new(self.frequency.clone())
    }

    pub fn recipients(&self) -> Vec<String> {
        crate::config::split_list(&self.emails)
    }
}

/// One scheduled render of a reporting task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub period_from: Option<DateTime<Utc>>,
    pub period_to: Option<DateTime<Utc>>,
    pub sent_to: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl HistoryEntry {
    pub fn new(task_id: Uuid, executed_at: DateTime<Utc>, status: ExecutionStatus) -> Self {
        HistoryEntry {
            id: Uuid::new_v4(),
            task_id,
            executed_at,
            status,
            period_from: None,
            period_to: None,
            sent_to: None,
            error: None,
            duration_ms: 0,
        }
    }
}

/// A reporting activity record: one API call, its request and its response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDocument {
    pub id: Uuid,
    pub datetime: DateTime<Utc>,
    pub action: String,
    pub index: Option<String>,
    pub response_time: Option<i64>,
    pub metadata: Value,
    pub request: Value,
    pub response: Value,
    pub user: Option<ActivityUser>,
}

impl MetricDocument {
    pub fn new(action: impl Into<String>, datetime: DateTime<Utc>, metadata: Value) -> Self {
        MetricDocument {
            id: Uuid::new_v4(),
            datetime,
            action: action.into(),
            index: None,
            response_time: None,
            metadata,
            request: Value::Null,
            response: Value::Null,
            user: None,
        }
    }

    pub fn broadcasted(&self) -> Option<&str> {
        self.metadata.get("broadcasted").and_then(Value::as_str)
    }
}

/// A platform metrics document, read from the Elasticsearch metrics index.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformMetric {
    /// Elasticsearch document id.
    pub id: String,
    pub datetime: DateTime<Utc>,
    pub action: String,
    pub index: Option<String>,
    pub metadata: Value,
    pub user: Option<ActivityUser>,
}

impl PlatformMetric {
    pub fn broadcasted(&self) -> Option<&str> {
        self.metadata.get("broadcasted").and_then(Value::as_str)
    }
}

/// Identity of the user behind an activity record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityUser {
    pub name: String,
    pub roles: Vec<String>,
    pub idp: Option<String>,
}
