use std::borrow::Cow;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use serde_json::json;
use thiserror::Error;
use validator::{ValidationError, ValidationErrors};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Task not found")]
    NotFound,

    #[error("Validation Error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Forbidden")]
    Forbidden,

    #[error("Elasticsearch Error: {0}")]
    Elastic(#[from] ElasticError),

    #[error("Render Error: {0}")]
    Render(#[from] RenderError),

    #[error("Mail Error: {0}")]
    Mail(#[from] MailError),
}

impl AppError {
    /// Builds a validation error carrying a single field failure.
    pub fn invalid_field(field: &'static str, code: &'static str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(
            field,
            ValidationError::new(code).with_message(Cow::Owned(message.into())),
        );
        AppError::Validation(errors)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, "Resource Not Found".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "You have no rights to access this page.".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Elastic(e) => {
                tracing::error!("Elasticsearch error: {}", e);
                (StatusCode::BAD_GATEWAY, "Upstream Error".to_string())
            }
            AppError::Render(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Mail(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = match self {
            AppError::Validation(errors) => json!({
                "error": message,
                "code": status.as_u16(),
                "details": errors,
            }),
            _ => json!({ "error": message, "code": status.as_u16() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Failures talking to Elasticsearch.
#[derive(Error, Debug)]
pub enum ElasticError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

/// Failures of a dashboard render job.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid task frequency: {0}")]
    InvalidFrequency(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("dashboard lookup failed: {0}")]
    Dashboard(#[from] ElasticError),

    #[error("asset error: {0}")]
    Asset(#[from] std::io::Error),
}

impl From<reqwest::Error> for RenderError {
    fn from(e: reqwest::Error) -> Self {
        RenderError::Browser(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("invalid address '{0}'")]
    Address(String),

    #[error("cannot build message: {0}")]
    Build(String),

    #[error("SMTP transport: {0}")]
    Transport(String),
}
