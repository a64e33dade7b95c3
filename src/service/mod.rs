use std::sync::Arc;

use crate::api::dto::TaskPayload;
use crate::clock::Clock;
use crate::db::queries::TaskRepository;
use crate::domain::{Frequency, HistoryEntry, ReportingTask};
use crate::errors::AppError;
use sqlx::SqlitePool;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;
use validator::Validate;

pub mod runner;

pub use runner::ReportRunner;

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct ReportingService {
    db_pool: SqlitePool,
    scheduler_tx: Sender<()>,
    clock: Arc<dyn Clock>,
}

impl ReportingService {
    pub fn new(db_pool: SqlitePool, scheduler_tx: Sender<()>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db_pool,
            scheduler_tx,
            clock,
        }
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Wakes the scheduler so it picks up schedule changes.
    ///
    /// If the channel is full or the receiver dropped, the next wake-up will do.
    fn notify_scheduler(&self) {
        let _ = self.scheduler_tx.try_send(());
    }

    pub async fn list_tasks(&self, space: Option<&str>) -> Result<Vec<ReportingTask>, AppError> {
        let repo = TaskRepository::new(&self.db_pool);
        Ok(repo.list_tasks(space).await?)
    }

    pub async fn create_task(&self, req: TaskPayload) -> Result<ReportingTask, AppError> {
        req.validate()?;

        let frequency = Frequency::new(req.frequency.trim());
        let task = ReportingTask::new(
            req.dashboard_id.trim(),
            req.space(),
            &frequency,
            req.normalized_emails(),
            req.print.unwrap_or(false),
            self.clock.now(),
        );

        let repo = TaskRepository::new(&self.db_pool);
        repo.create_task(&task).await?;

        self.notify_scheduler();
        tracing::info!(task_id = %task.id, next_run = ?task.next_run, "Reporting task created");

        Ok(task)
    }

    pub async fn update_task(&self, id: Uuid, req: TaskPayload) -> Result<ReportingTask, AppError> {
        req.validate()?;

        let repo = TaskRepository::new(&self.db_pool);
        let mut task = repo.get_live_task(id).await?.ok_or(AppError::NotFound)?;
        let now = self.clock.now();

        let frequency = Frequency::new(req.frequency.trim());
        if frequency.as_str() != task.frequency || task.next_run.is_none() {
            task.next_run = frequency.start_of_next_period(now);
        }

        task.dashboard_id = req.dashboard_id.trim().to_string();
        task.space = req.space();
        task.frequency = frequency.as_str().to_string();
        task.emails = req.normalized_emails();
        task.print = req.print.unwrap_or(task.print);
        task.updated_at = now;

        if repo.update_task(&task).await? == 0 {
            return Err(AppError::NotFound);
        }

        self.notify_scheduler();
        tracing::info!(task_id = %task.id, "Reporting task updated");

        Ok(task)
    }

    /// Soft deletes tasks. Fails when none of them was live.
    pub async fn delete_tasks(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let repo = TaskRepository::new(&self.db_pool);
        let deleted = repo.delete_tasks(ids, self.clock.now()).await?;

        if deleted == 0 {
            return Err(AppError::NotFound);
        }

        self.notify_scheduler();
        tracing::info!(count = deleted, "Reporting tasks deleted");

        Ok(deleted)
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>, AppError> {
        let repo = TaskRepository::new(&self.db_pool);
        if repo.get_task(id).await?.is_none() {
            return Err(AppError::NotFound);
        }

        Ok(repo.list_history(id).await?)
    }
}
