use crate::domain::{ActivityUser, HistoryEntry, MetricDocument, ReportingTask};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, QueryBuilder, Row, Sqlite, SqlitePool, types::Json};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, dashboard_id, space, frequency, emails, print, next_run, created_at, updated_at, deleted_at";

pub struct TaskRepository<'a> {
    pub pool: &'a SqlitePool,
}

impl<'a> TaskRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a new reporting task in the database.
    ///
    /// # Arguments
    ///
    /// * `task` - A reference to the ReportingTask entity to be created.
    ///
    /// # Returns
    /// * `sqlx::Result<()>` - Result indicating success or failure of the operation.
    pub async fn create_task(&self, task: &ReportingTask) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, dashboard_id, space, frequency, emails, print, next_run, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id)
        .bind(&task.dashboard_id)
        .bind(&task.space)
        .bind(&task.frequency)
        .bind(&task.emails)
        .bind(task.print)
        .bind(task.next_run)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Retrieves a task by its ID, soft deleted tasks included.
    ///
    /// # Arguments
    ///
    /// * `id` - The UUID of the task to retrieve.
    ///
    /// # Returns
    /// * `sqlx::Result<Option<ReportingTask>>` - The task if found, or None.
    pub async fn get_task(&self, id: Uuid) -> sqlx::Result<Option<ReportingTask>> {
        sqlx::query_as::<_, ReportingTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await
    }

    /// Retrieves a task by its ID unless it was deleted.
    pub async fn get_live_task(&self, id: Uuid) -> sqlx::Result<Option<ReportingTask>> {
        Ok(self.get_task(id).await?.filter(|t| t.deleted_at.is_none()))
    }

    /// Lists live tasks, newest first, optionally restricted to one space.
    pub async fn list_tasks(&self, space: Option<&str>) -> sqlx::Result<Vec<ReportingTask>> {
        match space {
            Some(space) => {
                sqlx::query_as::<_, ReportingTask>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL AND space = ? ORDER BY created_at DESC"
                ))
                .bind(space)
                .fetch_all(self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ReportingTask>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL ORDER BY created_at DESC"
                ))
                .fetch_all(self.pool)
                .await
            }
        }
    }

    /// Overwrites the editable fields of a live task.
    pub async fn update_task(&self, task: &ReportingTask) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET dashboard_id = ?, space = ?, frequency = ?, emails = ?, print = ?, next_run = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&task.dashboard_id)
        .bind(&task.space)
        .bind(&task.frequency)
        .bind(&task.emails)
        .bind(task.print)
        .bind(task.next_run)
        .bind(task.updated_at)
        .bind(task.id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Soft deletes live tasks by setting their deleted_at timestamp.
    ///
    /// # Returns
    /// * `sqlx::Result<u64>` - Result containing the number of rows affected.
    pub async fn delete_tasks(&self, ids: &[Uuid], at: DateTime<Utc>) -> sqlx::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE tasks SET deleted_at = ");
        query.push_bind(at);
        query.push(" WHERE deleted_at IS NULL AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn update_next_run_with_executor<'c, E>(
        executor: E,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> sqlx::Result<u64>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET next_run = ?
            WHERE id = ?
            "#,
        )
        .bind(next_run)
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// The live task with the earliest next run, due or not.
    pub async fn get_next_pending_task(&self) -> sqlx::Result<Option<ReportingTask>> {
        sqlx::query_as::<_, ReportingTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE deleted_at IS NULL AND next_run IS NOT NULL
            ORDER BY next_run ASC
            LIMIT 1
            "#
        ))
        .fetch_optional(self.pool)
        .await
    }

    pub async fn insert_history_with_executor<'c, E>(
        executor: E,
        entry: &HistoryEntry,
    ) -> sqlx::Result<()>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO history (id, task_id, executed_at, status, period_from, period_to, sent_to, error, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.task_id)
        .bind(entry.executed_at)
        .bind(entry.status.clone())
        .bind(entry.period_from)
        .bind(entry.period_to)
        .bind(&entry.sent_to)
        .bind(&entry.error)
        .bind(entry.duration_ms)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Render history of a task, newest first.
    pub async fn list_history(&self, task_id: Uuid) -> sqlx::Result<Vec<HistoryEntry>> {
        sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, task_id, executed_at, status, period_from, period_to, sent_to, error, duration_ms
            FROM history
            WHERE task_id = ?
            ORDER BY executed_at DESC
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool)
        .await
    }
}

/// Table holding the activity of the reporting API.
pub const ACTIVITY_TABLE: &str = "reporting_activity";

/// Upper bound of documents read per query.
pub const MAX_DOCUMENTS: i64 = 10_000;

pub struct ActivityRepository<'a> {
    pub pool: &'a SqlitePool,
}

impl<'a> ActivityRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the table from the metrics template when it does not exist yet.
    pub async fn ensure_table(&self) -> sqlx::Result<()> {
        let statement = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BLOB PRIMARY KEY NOT NULL,
                datetime TEXT NOT NULL,
                action TEXT NOT NULL,
                index_name TEXT,
                response_time INTEGER,
                metadata TEXT,
                request TEXT,
                response TEXT,
                user TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_datetime ON {table} (datetime, action);
            "#,
            table = ACTIVITY_TABLE
        );

        sqlx::raw_sql(&statement).execute(self.pool).await?;
        Ok(())
    }

    pub async fn insert(&self, doc: &MetricDocument) -> sqlx::Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {ACTIVITY_TABLE} (id, datetime, action, index_name, response_time, metadata, request, response, user)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        ))
        .bind(doc.id)
        .bind(doc.datetime)
        .bind(&doc.action)
        .bind(&doc.index)
        .bind(doc.response_time)
        .bind(Json(&doc.metadata))
        .bind(Json(&doc.request))
        .bind(Json(&doc.response))
        .bind(doc.user.as_ref().map(Json))
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> sqlx::Result<Option<MetricDocument>> {
        let row = sqlx::query(&format!("SELECT * FROM {ACTIVITY_TABLE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    /// Records dated at or after `since`, whose action is one of `actions`,
    /// which were answered with a 2xx status and never included in a digest.
    /// Newest first.
    pub async fn unbroadcasted(
        &self,
        since: DateTime<Utc>,
        actions: &[&str],
    ) -> sqlx::Result<Vec<MetricDocument>> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            r#"
            SELECT * FROM {ACTIVITY_TABLE}
            WHERE json_extract(metadata, '$.broadcasted') IS NULL
              AND json_extract(response, '$.status') BETWEEN 200 AND 299
              AND datetime >= "#
        ));
        query.push_bind(since);
        query.push(" AND action IN (");
        let mut separated = query.separated(", ");
        for action in actions {
            separated.push_bind(action.to_string());
        }
        separated.push_unseparated(")");
        query.push(" ORDER BY datetime DESC LIMIT ");
        query.push_bind(MAX_DOCUMENTS);

        let rows = query.build().fetch_all(self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Sets `metadata.broadcasted` on every given record.
    pub async fn mark_broadcasted(&self, ids: &[Uuid], at: DateTime<Utc>) -> sqlx::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {ACTIVITY_TABLE} SET metadata = json_set(CASE WHEN json_type(metadata) = 'object' THEN metadata ELSE '{{}}' END, '$.broadcasted', "
        ));
        query.push_bind(at.to_rfc3339());
        query.push(") WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn document_from_row(row: &SqliteRow) -> sqlx::Result<MetricDocument> {
    let json = |column: &str| -> sqlx::Result<Value> {
        Ok(row
            .try_get::<Option<Json<Value>>, _>(column)?
            .map(|j| j.0)
            .unwrap_or(Value::Null))
    };

    Ok(MetricDocument {
        id: row.try_get("id")?,
        datetime: row.try_get("datetime")?,
        action: row.try_get("action")?,
        index: row.try_get("index_name")?,
        response_time: row.try_get("response_time")?,
        metadata: json("metadata")?,
        request: json("request")?,
        response: json("response")?,
        user: row
            .try_get::<Option<Json<ActivityUser>>, _>("user")?
            .map(|j| j.0),
    })
}
