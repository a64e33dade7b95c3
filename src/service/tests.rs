use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::api::dto::TaskPayload;
use crate::clock::ManualClock;
use crate::db::queries::TaskRepository;
use crate::domain::ExecutionStatus;
use crate::errors::AppError;
use crate::service::{ReportRunner, ReportingService};
use crate::tests::fakes::{FakeRenderer, RecordingMailer};

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 21, 9, 30, 0).unwrap()
}

fn setup_service(pool: SqlitePool) -> (ReportingService, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(10);
    (
        ReportingService::new(pool, tx, Arc::new(ManualClock::new(now()))),
        rx,
    )
}

fn payload(frequency: &str) -> TaskPayload {
    TaskPayload {
        dashboard_id: "5b9c4a6e-3f0b-4d7a-9a4e-8c1f2d3e4f50".into(),
        space: Some("team".into()),
        frequency: frequency.into(),
        emails: "jdoe@example.org , admin@example.org".into(),
        print: Some(false),
    }
}

#[sqlx::test]
async fn test_create_task_schedules_next_period(pool: SqlitePool) -> sqlx::Result<()> {
    let (service, mut rx) = setup_service(pool.clone());

    let task = service.create_task(payload("monthly")).await.unwrap();

    assert_eq!(task.emails, "jdoe@example.org,admin@example.org");
    assert_eq!(
        task.next_run,
        Some(Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap())
    );
    assert!(rx.try_recv().is_ok(), "Scheduler should be notified");

    let stored = TaskRepository::new(&pool).get_task(task.id).await?.unwrap();
    assert_eq!(stored, task);

    Ok(())
}

#[sqlx::test]
async fn test_create_task_rejects_invalid_payload(pool: SqlitePool) {
    let (service, mut rx) = setup_service(pool);

    let result = service.create_task(payload("hourly")).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(rx.try_recv().is_err(), "Nothing to schedule");
}

#[sqlx::test]
async fn test_update_task_reschedules_on_frequency_change(pool: SqlitePool) {
    let (service, _rx) = setup_service(pool);
    let task = service.create_task(payload("monthly")).await.unwrap();

    let mut change = payload("weekly");
    change.print = Some(true);
    let updated = service.update_task(task.id, change).await.unwrap();

    assert!(updated.print);
    assert_eq!(updated.frequency, "weekly");
    assert_eq!(
        updated.next_run,
        Some(Utc.with_ymd_and_hms(2026, 10, 26, 0, 0, 0).unwrap())
    );

    let missing = service
        .update_task(uuid::Uuid::new_v4(), payload("weekly"))
        .await;
    assert!(matches!(missing, Err(AppError::NotFound)));
}

#[sqlx::test]
async fn test_delete_tasks_in_batch(pool: SqlitePool) {
    let (service, _rx) = setup_service(pool);
    let a = service.create_task(payload("daily")).await.unwrap();
    let b = service.create_task(payload("daily")).await.unwrap();

    let deleted = service.delete_tasks(&[a.id, b.id]).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(service.list_tasks(None).await.unwrap().is_empty());

    let again = service.delete_tasks(&[a.id]).await;
    assert!(matches!(again, Err(AppError::NotFound)));

    // History stays reachable after deletion
    assert!(service.history(a.id).await.unwrap().is_empty());
    assert!(matches!(
        service.history(uuid::Uuid::new_v4()).await,
        Err(AppError::NotFound)
    ));
}

#[sqlx::test]
async fn test_process_task_records_failure_and_reschedules(pool: SqlitePool) -> sqlx::Result<()> {
    let (service, _rx) = setup_service(pool.clone());
    let task = service.create_task(payload("daily")).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let runner = ReportRunner::new(
        service,
        Arc::new(FakeRenderer {
            fail: true,
            ..Default::default()
        }),
        mailer.clone(),
        "reporting@example.org",
    );

    let entry = runner.process_task(task.clone()).await.unwrap();
    assert_eq!(entry.status, ExecutionStatus::Failure);
    assert!(entry.error.unwrap().contains("timed out"));
    assert!(mailer.sent().is_empty());

    let repo = TaskRepository::new(&pool);
    let history = repo.list_history(task.id).await?;
    assert_eq!(history.len(), 1);

    let updated = repo.get_task(task.id).await?.unwrap();
    assert_eq!(
        updated.next_run,
        Some(Utc.with_ymd_and_hms(2026, 10, 22, 0, 0, 0).unwrap())
    );

    Ok(())
}

#[sqlx::test]
async fn test_process_task_mails_report(pool: SqlitePool) {
    let (service, _rx) = setup_service(pool);
    let task = service.create_task(payload("weekly")).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let renderer = Arc::new(FakeRenderer::default());
    let runner = ReportRunner::new(service, renderer.clone(), mailer.clone(), "reporting@example.org");

    let entry = runner.process_task(task.clone()).await.unwrap();
    assert_eq!(entry.status, ExecutionStatus::Success);
    assert_eq!(
        entry.sent_to.as_deref(),
        Some("jdoe@example.org,admin@example.org")
    );

    let rendered = renderer.renders.lock().unwrap().clone();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].space.as_deref(), Some("team"));

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["jdoe@example.org", "admin@example.org"]);
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].content_type, "application/pdf");
    assert!(sent[0].subject.contains("Usage"));
}

#[sqlx::test]
async fn test_mail_failure_is_recorded(pool: SqlitePool) {
    let (service, _rx) = setup_service(pool);
    let task = service.create_task(payload("weekly")).await.unwrap();

    let runner = ReportRunner::new(
        service,
        Arc::new(FakeRenderer::default()),
        Arc::new(RecordingMailer::failing()),
        "reporting@example.org",
    );

    let entry = runner.process_task(task).await.unwrap();
    assert_eq!(entry.status, ExecutionStatus::Failure);
    assert!(entry.sent_to.is_none());
    assert!(entry.period_from.is_some());
}

#[sqlx::test]
async fn test_storage_failure_still_moves_task_on(pool: SqlitePool) -> sqlx::Result<()> {
    let (service, _rx) = setup_service(pool.clone());
    let task = service.create_task(payload("daily")).await.unwrap();

    // History can no longer be written once the report is out
    sqlx::query("DROP TABLE history").execute(&pool).await?;

    let mailer = Arc::new(RecordingMailer::default());
    let runner = ReportRunner::new(
        service,
        Arc::new(FakeRenderer::default()),
        mailer.clone(),
        "reporting@example.org",
    );

    let result = runner.process_task(task.clone()).await;
    assert!(matches!(result, Err(AppError::Database(_))));
    assert_eq!(mailer.sent().len(), 1);

    let updated = TaskRepository::new(&pool).get_task(task.id).await?.unwrap();
    assert_eq!(
        updated.next_run,
        Some(Utc.with_ymd_and_hms(2026, 10, 22, 0, 0, 0).unwrap())
    );

    Ok(())
}
