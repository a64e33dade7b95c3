use crate::errors::AppError;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub server_port: u16,
    pub rust_log: String,
    pub elastic: ElasticConfig,
    pub kibana: KibanaConfig,
    pub render: RenderConfig,
    pub reporting_index: String,
    pub activity_index: String,
    pub smtp: SmtpConfig,
    pub report_sender: String,
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct KibanaConfig {
    /// Address the browser uses to reach Kibana, when it differs from the public one.
    pub internal_url: Option<String>,
    pub external_url: String,
}

impl KibanaConfig {
    pub fn browser_url(&self) -> &str {
        self.internal_url.as_deref().unwrap_or(&self.external_url)
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub webdriver_url: String,
    pub timeout: Duration,
    pub settle_delay: Duration,
    pub assets_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationsConfig {
    /// Elasticsearch index holding the platform metrics.
    pub metrics_index: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cron: String,
    pub send_empty_activity: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let db_url = env::var("DATABASE_URL").unwrap_or("sqlite:./ezreporting.db".to_string());
        let server_port = parse_var("SERVER_PORT", 8080u16)?;
        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let elastic = ElasticConfig {
            url: var_or("ELASTIC_URL", "http://localhost:9200"),
            username: var_or("ELASTIC_USERNAME", "elastic"),
            password: var_or("ELASTIC_PASSWORD", "changeme"),
        };

        let kibana = KibanaConfig {
            internal_url: env::var("KIBANA_INTERNAL_URL").ok().filter(|u| !u.is_empty()),
            external_url: var_or("KIBANA_EXTERNAL_URL", "http://localhost:5601"),
        };

        let render = RenderConfig {
            webdriver_url: var_or("WEBDRIVER_URL", "http://localhost:4444"),
            timeout: Duration::from_millis(parse_var("RENDER_TIMEOUT_MS", 30_000u64)?),
            settle_delay: Duration::from_millis(parse_var("RENDER_SETTLE_MS", 5_000u64)?),
            assets_dir: PathBuf::from(var_or("ASSETS_DIR", "assets")),
        };

        let smtp = SmtpConfig {
            host: var_or("SMTP_HOST", "localhost"),
            port: parse_var("SMTP_PORT", 25u16)?,
            secure: parse_var("SMTP_SECURE", false)?,
        };

        let notifications = NotificationsConfig {
            metrics_index: var_or("METRICS_INDEX", ".ezmesure-metrics"),
            sender: var_or("NOTIFICATIONS_SENDER", "ezMESURE <noreply@ezmesure.localhost>"),
            recipients: split_list(&env::var("NOTIFICATIONS_RECIPIENTS").unwrap_or_default()),
            cron: var_or("NOTIFICATIONS_CRON", "0 0 0 * * *"),
            send_empty_activity: parse_var("NOTIFICATIONS_SEND_EMPTY", true)?,
        };

        Ok(Config {
            db_url,
            server_port,
            rust_log,
            elastic,
            kibana,
            render,
            reporting_index: var_or("REPORTING_INDEX", ".ezreporting"),
            activity_index: var_or("ACTIVITY_INDEX", ".ezreporting-activity"),
            smtp,
            report_sender: var_or("REPORT_SENDER", "reporting@ezmesure.localhost"),
            notifications,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            AppError::Config(format!("{} '{}' is not a valid value", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
