use std::time::Duration;

use crate::{db::queries::TaskRepository, service::ReportRunner};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod cron;


/// How long to sleep when no task is scheduled at all.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Pause after a first error, doubled on each consecutive one.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Pause after the `failures`-th consecutive error.
fn error_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    ERROR_BACKOFF.saturating_mul(factor).min(MAX_ERROR_BACKOFF)
}

/// Sleeps for `duration`. Returns `true` if cancelled in the meantime.
async fn cancelled_during(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Renders reporting tasks as they fall due, one at a time.
///
/// `rx` wakes the loop up whenever tasks are created, updated or deleted so
/// that it recomputes its next deadline.
pub async fn run_scheduler(
    runner: ReportRunner,
    mut rx: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    let service = runner.service().clone();
    let repo = TaskRepository::new(service.get_pool());
    let mut failures = 0u32;

    loop {
        let next_task = match repo.get_next_pending_task().await {
            Ok(task) => task,
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::error!(failures, "Failed to fetch next task: {:?}", e);
                if cancelled_during(&token, error_backoff(failures)).await {
                    break;
                }
                continue;
            }
        };

        let sleep_duration = match next_task.as_ref().and_then(|t| t.next_run) {
            Some(next_run) => (next_run - service.clock().now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => IDLE_SLEEP,
        };

        tracing::info!(
            "Scheduler sleeping for {:?}. Next task: {:?}",
            sleep_duration,
            next_task.as_ref().map(|t| t.id)
        );

        tokio::select! {
            // Cancellation signal received
            _ = token.cancelled() => {
                tracing::info!("Scheduler received cancellation signal. Exiting.");
                break;
            }
            // Timer elapsed
            _ = tokio::time::sleep(sleep_duration) => {
                if let Some(task) = next_task {
                    let due = task.next_run.is_some_and(|at| at <= service.clock().now());
                    if due {
                        match runner.process_task(task).await {
                            Ok(_) => failures = 0,
                            Err(e) => {
                                failures = failures.saturating_add(1);
                                let backoff = error_backoff(failures);
                                tracing::error!(failures, ?backoff, "Error processing task: {:?}", e);
                                if cancelled_during(&token, backoff).await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            // Schedule change notification received
            Some(()) = rx.recv() => {
                tracing::info!("Received schedule change notification.");
            }
        }
    }
    tracing::info!("Scheduler exited cleanly!")
}
