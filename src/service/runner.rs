use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::db::queries::TaskRepository;
use crate::domain::{ExecutionStatus, HistoryEntry, ReportingTask};
use crate::errors::AppError;
use crate::mail::{Attachment, Mail, Mailer};
use crate::render::{DashboardRenderer, RenderParams, RenderResult};
use crate::service::ReportingService;

/// Renders due tasks and mails the result to their recipients.
#[derive(Clone)]
pub struct ReportRunner {
    service: ReportingService,
    renderer: Arc<dyn DashboardRenderer>,
    mailer: Arc<dyn Mailer>,
    sender: String,
}

impl ReportRunner {
    pub fn new(
        service: ReportingService,
        renderer: Arc<dyn DashboardRenderer>,
        mailer: Arc<dyn Mailer>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            service,
            renderer,
            mailer,
            sender: sender.into(),
        }
    }

    pub fn service(&self) -> &ReportingService {
        &self.service
    }

    /// Runs one task, records the outcome and moves it to its next period.
    ///
    /// Render and mail failures end up in the history entry; only storage
    /// failures are returned. When the history cannot be stored the task is
    /// still moved to its next period, so a mailed report is not sent twice.
    pub async fn process_task(&self, task: ReportingTask) -> Result<HistoryEntry, AppError> {
        tracing::info!(task_id = %task.id, dashboard = %task.dashboard_id, "Processing reporting task");

        let started = Instant::now();
        let now = self.service.clock().now();
        let mut entry = HistoryEntry::new(task.id, now, ExecutionStatus::Success);

        let params = RenderParams {
            dashboard_id: task.dashboard_id.clone(),
            space: task.space.clone(),
            frequency: task.frequency.clone(),
            print: task.print,
        };

        match self.renderer.render(&params).await {
            Ok(Some(result)) => {
                entry.period_from = Some(result.period.from);
                entry.period_to = Some(result.period.to);

                let recipients = task.recipients();
                match self.mailer.send(self.report_mail(&task, &result, &recipients)).await {
                    Ok(()) => entry.sent_to = Some(recipients.join(",")),
                    Err(e) => {
                        entry.status = ExecutionStatus::Failure;
                        entry.error = Some(e.to_string());
                    }
                }
            }
            Ok(None) => {
                entry.status = ExecutionStatus::Failure;
                entry.error = Some("report assets not found, nothing was rendered".into());
            }
            Err(e) => {
                entry.status = ExecutionStatus::Failure;
                entry.error = Some(e.to_string());
            }
        }
        entry.duration_ms = started.elapsed().as_millis() as i64;

        let next_run = task.frequency().start_of_next_period(now);
        if next_run.is_none() {
            tracing::error!(task_id = %task.id, frequency = %task.frequency, "Task disabled: invalid frequency");
        }

        if let Err(e) = self.record_outcome(&entry, next_run).await {
            // The report may already be out: the task must move on even without its history.
            if let Err(fallback) = TaskRepository::update_next_run_with_executor(
                self.service.get_pool(),
                task.id,
                next_run,
            )
            .await
            {
                tracing::error!(task_id = %task.id, "Failed to reschedule task: {}", fallback);
            }
            return Err(e);
        }

        match &entry.error {
            Some(error) => tracing::error!(task_id = %task.id, "Reporting task failed: {}", error),
            None => tracing::info!(task_id = %task.id, next_run = ?next_run, "Reporting task processed"),
        }

        Ok(entry)
    }

    /// Stores the history entry and the next run in one transaction.
    async fn record_outcome(
        &self,
        entry: &HistoryEntry,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut tx = self.service.get_pool().begin().await?;
        TaskRepository::insert_history_with_executor(&mut *tx, entry).await?;
        TaskRepository::update_next_run_with_executor(&mut *tx, entry.task_id, next_run).await?;
        tx.commit().await?;
        Ok(())
    }

    fn report_mail(&self, task: &ReportingTask, result: &RenderResult, recipients: &[String]) -> Mail {
        let title = result.dashboard_title.as_deref().unwrap_or(&task.dashboard_id);
        let from = result.period.from.format("%d/%m/%Y");
        let to = result.period.to.format("%d/%m/%Y");

        Mail {
            from: self.sender.clone(),
            to: recipients.to_vec(),
            subject: format!("Reporting ezMESURE [{}] - {}", to, title),
            text: format!(
                "Please find attached the report of the dashboard \"{}\" covering {} to {}.\n\nDashboard: {}\n",
                title, from, to, result.dashboard_url
            ),
            html: None,
            attachments: vec![Attachment {
                filename: format!(
                    "reporting_ezMESURE_{}_{}.pdf",
                    task.dashboard_id,
                    result.period.to.format("%Y-%m-%d")
                ),
                content_type: mime::APPLICATION_PDF.to_string(),
                data: result.pdf.clone(),
            }],
        }
    }
}
