use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ezreporting::{
    activity::ActivityLogger,
    api::{self, AppState},
    clock::{Clock, SystemClock},
    config::Config,
    db,
    elastic::ElasticClient,
    mail::SmtpMailer,
    notifications::{self, NotificationService},
    render::{BrowserRenderer, webdriver::WebDriverBrowser},
    scheduler::{self, cron::CronSchedule},
    service::{ReportRunner, ReportingService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ezreporting...");

    let pool = db::init_pool(&config.db_url)
        .await
        .context("Failed to open the database")?;
    tracing::info!("Database connection pool established, migrations applied.");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let elastic = Arc::new(ElasticClient::new(&config.elastic)?);
    let mailer = Arc::new(SmtpMailer::new(&config.smtp)?);
    let browser = Arc::new(WebDriverBrowser::new(
        &config.render.webdriver_url,
        config.render.timeout,
    )?);
    let renderer = Arc::new(BrowserRenderer::new(
        browser,
        elastic.clone(),
        clock.clone(),
        config.kibana.clone(),
        config.render.clone(),
        config.elastic.username.clone(),
        config.elastic.password.clone(),
    ));
    let notifications_cron: CronSchedule = config.notifications.cron.parse()?;

    let (scheduler_tx, scheduler_rx) = mpsc::channel::<()>(100);

    tracing::info!("Created scheduler channels.");

    let cancel_token = CancellationToken::new();

    let service = ReportingService::new(pool.clone(), scheduler_tx, clock.clone());
    let runner = ReportRunner::new(
        service.clone(),
        renderer,
        mailer.clone(),
        config.report_sender.clone(),
    );

    let scheduler_token = cancel_token.clone();
    let report_scheduler = tokio::spawn(async move {
        tracing::info!("Report scheduler started.");
        scheduler::run_scheduler(runner, scheduler_rx, scheduler_token).await;
    });

    let notification_service = NotificationService::new(
        pool.clone(),
        elastic.clone(),
        mailer,
        elastic.clone(),
        elastic.clone(),
        clock,
        config.notifications.clone(),
    );
    let notifications_token = cancel_token.clone();
    let notification_job = tokio::spawn(async move {
        notifications::run_notifications(
            notification_service,
            notifications_cron,
            notifications_token,
        )
        .await;
    });

    let activity = ActivityLogger::new(pool, elastic.clone(), config.activity_index.clone());
    let app = api::router(AppState::new(
        service,
        activity,
        elastic,
        config.reporting_index.clone(),
    ));
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("API Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    let _ = tokio::join!(report_scheduler, notification_job);
    tracing::info!("Application shut down gracefully.");

    Ok(())
}

/// Listens for shutdown signals (Ctrl+C or termination) and triggers cancellation.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received.");
    token.cancel();
}
