//! Audit trail of the reporting API.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::queries::ActivityRepository;
use crate::domain::MetricDocument;
use crate::elastic::UserDirectory;

#[cfg(test)]
mod tests;

/// Actions whose successful responses are not worth keeping.
const TRUNCATED_ACTIONS: &[&str] = &["reporting/list", "reporting/history", "reporting/delete"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub query: BTreeMap<String, String>,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<String>,
}

/// Everything known about one API call once it has been answered.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub started_at: DateTime<Utc>,
    pub action: String,
    pub response_time_ms: i64,
    pub metadata: Value,
    pub request: RequestSnapshot,
    pub status: u16,
    pub body: Option<Value>,
    pub username: Option<String>,
}

#[derive(Clone)]
pub struct ActivityLogger {
    pool: SqlitePool,
    users: Arc<dyn UserDirectory>,
    index: String,
}

impl ActivityLogger {
    pub fn new(pool: SqlitePool, users: Arc<dyn UserDirectory>, index: impl Into<String>) -> Self {
        Self {
            pool,
            users,
            index: index.into(),
        }
    }

    /// Appends one activity record.
    ///
    /// The activity table is created on first use. Failing to create it or
    /// to resolve the user is logged and the record is written anyway.
    pub async fn save(&self, ctx: ActivityContext) -> Result<Uuid, sqlx::Error> {
        let repo = ActivityRepository::new(&self.pool);

        if let Err(e) = repo.ensure_table().await {
            tracing::warn!("Failed to create activity table: {:?}", e);
        }

        let mut doc = MetricDocument::new(ctx.action.clone(), ctx.started_at, ctx.metadata);
        doc.index = Some(self.index.clone());
        doc.response_time = Some(ctx.response_time_ms);
        doc.request = serde_json::to_value(&ctx.request).unwrap_or(Value::Null);
        doc.response = json!({
            "status": ctx.status,
            "body": response_body(&ctx.action, ctx.body),
        });

        if let Some(username) = ctx.username.as_deref().filter(|u| !u.is_empty()) {
            doc.user = match self.users.find_user(username).await {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(%username, "Failed to resolve activity user: {}", e);
                    None
                }
            };
        }

        repo.insert(&doc).await?;
        tracing::debug!(action = %doc.action, id = %doc.id, "Activity recorded");

        Ok(doc.id)
    }
}

/// Body kept on the record: only JSON objects and arrays, and for read-like
/// actions only when they report an error.
fn response_body(action: &str, body: Option<Value>) -> Value {
    let Some(body) = body.filter(|b| b.is_object() || b.is_array()) else {
        return Value::Null;
    };

    if TRUNCATED_ACTIONS.contains(&action) && body.get("error").is_none() {
        return Value::Null;
    }

    body
}
