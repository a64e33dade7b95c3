//! Weekly digest of platform and reporting activity, mailed to the
//! administrators on a cron schedule.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::NotificationsConfig;
use crate::db::queries::{ActivityRepository, TaskRepository};
use crate::domain::{ActivityUser, MetricDocument, PlatformMetric, ReportingTask};
use crate::elastic::{DashboardSource, PlatformMetrics, UserDirectory};
use crate::errors::AppError;
use crate::mail::{Mail, Mailer};
use crate::scheduler::cron::CronSchedule;


/// Platform actions worth reporting.
pub const PLATFORM_ACTIONS: &[&str] = &[
    "file/upload",
    "file/delete",
    "file/delete-many",
    "user/register",
    "indices/insert",
];

pub const REPORTING_ACTIONS: &[&str] = &["reporting/store", "reporting/update", "reporting/delete"];

pub const DIGEST_SUBJECT: &str = "[Admin] Activité ezMESURE";

#[derive(Debug, Clone)]
pub struct FileActivity {
    pub action: String,
    pub datetime: DateTime<Utc>,
    pub paths: Vec<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UserRegistration {
    pub datetime: DateTime<Utc>,
    pub username: Option<String>,
    pub user: Option<ActivityUser>,
}

#[derive(Debug, Clone)]
pub struct ReportingActivity {
    pub action: String,
    pub datetime: DateTime<Utc>,
    pub actor: Option<String>,
    pub task: Option<ReportingTask>,
    pub dashboard_title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Digest {
    pub files: Vec<FileActivity>,
    pub users: Vec<UserRegistration>,
    pub insertions: Vec<PlatformMetric>,
    pub reportings: Vec<ReportingActivity>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.users.is_empty()
            && self.insertions.is_empty()
            && self.reportings.is_empty()
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec!["Recent activity on ezMESURE".to_string()];

        lines.push(format!("\nFiles ({})", self.files.len()));
        lines.extend(self.files.iter().map(|file| {
            format!(
                "- {} {} {} by {}",
                format_date(file.datetime),
                file.action,
                file.paths.join(", "),
                file.actor.as_deref().unwrap_or("unknown")
            )
        }));

        lines.push(format!("\nNew users ({})", self.users.len()));
        lines.extend(self.users.iter().map(|registration| {
            let roles = registration
                .user
                .as_ref()
                .map(|u| u.roles.join(", "))
                .unwrap_or_default();
            format!(
                "- {} {} [{}]",
                format_date(registration.datetime),
                registration.username.as_deref().unwrap_or("unknown"),
                roles
            )
        }));

        lines.push(format!("\nIndex insertions ({})", self.insertions.len()));
        lines.extend(self.insertions.iter().map(|insertion| {
            let index = insertion
                .metadata
                .get("index")
                .and_then(Value::as_str)
                .or(insertion.index.as_deref())
                .unwrap_or("unknown");
            format!("- {} {}", format_date(insertion.datetime), index)
        }));

        lines.push(format!("\nReporting ({})", self.reportings.len()));
        lines.extend(self.reportings.iter().map(|reporting| {
            let dashboard = reporting
                .dashboard_title
                .as_deref()
                .or(reporting.task.as_ref().map(|t| t.dashboard_id.as_str()))
                .unwrap_or("unknown dashboard");
            let frequency = reporting
                .task
                .as_ref()
                .map(|t| t.frequency.as_str())
                .unwrap_or("-");
            format!(
                "- {} {} \"{}\" ({}) by {}",
                format_date(reporting.datetime),
                reporting.action,
                dashboard,
                frequency,
                reporting.actor.as_deref().unwrap_or("unknown")
            )
        }));

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format("%d/%m/%Y %H:%M").to_string()
}

/// Outcome of one digest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestRun {
    pub sent: bool,
    pub marked: u64,
}

#[derive(Clone)]
pub struct NotificationService {
    pool: SqlitePool,
    metrics: Arc<dyn PlatformMetrics>,
    mailer: Arc<dyn Mailer>,
    users: Arc<dyn UserDirectory>,
    dashboards: Arc<dyn DashboardSource>,
    clock: Arc<dyn Clock>,
    config: NotificationsConfig,
}

impl NotificationService {
    pub fn new(
        pool: SqlitePool,
        metrics: Arc<dyn PlatformMetrics>,
        mailer: Arc<dyn Mailer>,
        users: Arc<dyn UserDirectory>,
        dashboards: Arc<dyn DashboardSource>,
        clock: Arc<dyn Clock>,
        config: NotificationsConfig,
    ) -> Self {
        Self {
            pool,
            metrics,
            mailer,
            users,
            dashboards,
            clock,
            config,
        }
    }

    /// Collects last week's unbroadcasted activity, mails it and marks it broadcasted.
    ///
    /// Documents are marked only after the mail went out; a crash in between
    /// means they are included again in the next digest.
    pub async fn run_once(&self) -> Result<DigestRun, AppError> {
        let now = self.clock.now();
        let since = now - Duration::weeks(1);

        let index = self.config.metrics_index.as_str();
        let reporting = ActivityRepository::new(&self.pool);
        reporting.ensure_table().await?;

        let platform_docs = self
            .metrics
            .unbroadcasted(index, since, PLATFORM_ACTIONS)
            .await?;
        let reporting_docs = reporting.unbroadcasted(since, REPORTING_ACTIONS).await?;

        let digest = self.build_digest(&platform_docs, &reporting_docs).await?;

        if digest.is_empty() && !self.config.send_empty_activity {
            tracing::info!("No recent activity, digest skipped");
            return Ok(DigestRun {
                sent: false,
                marked: 0,
            });
        }

        self.mailer
            .send(Mail {
                from: self.config.sender.clone(),
                to: self.config.recipients.clone(),
                subject: DIGEST_SUBJECT.to_string(),
                text: digest.render_text(),
                html: None,
                attachments: Vec::new(),
            })
            .await?;

        let reporting_ids: Vec<Uuid> = reporting_docs.iter().map(|d| d.id).collect();
        let platform_ids: Vec<String> = platform_docs.iter().map(|d| d.id.clone()).collect();
        let marked = reporting.mark_broadcasted(&reporting_ids, now).await?
            + self
                .metrics
                .mark_broadcasted(index, &platform_ids, now)
                .await?;

        Ok(DigestRun { sent: true, marked })
    }

    async fn build_digest(
        &self,
        platform_docs: &[PlatformMetric],
        reporting_docs: &[MetricDocument],
    ) -> Result<Digest, AppError> {
        let mut digest = Digest::default();

        for doc in platform_docs {
            if doc.action.starts_with("file/") {
                digest.files.push(FileActivity {
                    action: doc.action.clone(),
                    datetime: doc.datetime,
                    paths: paths(&doc.metadata),
                    actor: actor(doc.user.as_ref(), &doc.metadata),
                });
            } else if doc.action == "user/register" {
                let username = doc
                    .metadata
                    .get("username")
                    .and_then(Value::as_str)
                    .map(String::from);
                let user = match username.as_deref() {
                    Some(name) => self.users.find_user(name).await.unwrap_or_else(|e| {
                        tracing::warn!(%name, "Failed to look up registered user: {}", e);
                        None
                    }),
                    None => None,
                };
                digest.users.push(UserRegistration {
                    datetime: doc.datetime,
                    username,
                    user,
                });
            } else if doc.action == "indices/insert" {
                digest.insertions.push(doc.clone());
            }
        }

        let tasks = TaskRepository::new(&self.pool);
        for doc in reporting_docs {
            let task = match task_id(&doc.metadata) {
                Some(id) => tasks.get_task(id).await?,
                None => None,
            };

            let dashboard_title = match &task {
                Some(task) => self
                    .dashboards
                    .dashboard_title(&task.dashboard_id, task.space.as_deref())
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(task_id = %task.id, "Failed to resolve dashboard title: {}", e);
                        None
                    }),
                None => None,
            };

            digest.reportings.push(ReportingActivity {
                action: doc.action.clone(),
                datetime: doc.datetime,
                actor: actor(doc.user.as_ref(), &doc.metadata),
                task,
                dashboard_title,
            });
        }

        Ok(digest)
    }

    async fn run_logged(&self) {
        match self.run_once().await {
            Ok(run) if run.sent => {
                tracing::info!(marked = run.marked, "Recent activity successfully broadcasted")
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to broadcast recent activity: {}", e),
        }
    }
}

/// Runs the digest once right away, then on every tick of `schedule` until cancelled.
pub async fn run_notifications(
    service: NotificationService,
    schedule: CronSchedule,
    token: CancellationToken,
) {
    if service.config.recipients.is_empty() {
        tracing::warn!("No recipient configured, notifications will be disabled");
        return;
    }

    tracing::info!(cron = %schedule.expression(), "Notification job started");
    service.run_logged().await;

    loop {
        let now = service.clock.now();
        let Some(next) = schedule.next_after(now) else {
            tracing::warn!(cron = %schedule.expression(), "Cron expression never fires again");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("Notification job received cancellation signal. Exiting.");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                service.run_logged().await;
            }
        }
    }
}

fn paths(metadata: &Value) -> Vec<String> {
    match metadata.get("path") {
        Some(Value::String(path)) => vec![path.clone()],
        Some(Value::Array(paths)) => paths
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn actor(user: Option<&ActivityUser>, metadata: &Value) -> Option<String> {
    user.map(|u| u.name.clone()).or_else(|| {
        metadata
            .get("username")
            .and_then(Value::as_str)
            .map(String::from)
    })
}

fn task_id(metadata: &Value) -> Option<Uuid> {
    let raw = metadata.get("taskId").and_then(Value::as_str).or_else(|| {
        metadata
            .get("taskIds")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
    })?;

    Uuid::parse_str(raw).ok()
}
