use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::{Validate, ValidateEmail, ValidationError};

use crate::config::split_list;
use crate::domain::Frequency;

/// Body of `POST /tasks` and `PATCH /tasks/{id}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    #[serde(default)]
    #[validate(custom(function = "validate_guid"))]
    pub dashboard_id: String,
    pub space: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "validate_frequency"))]
    pub frequency: String,
    #[serde(default)]
    #[validate(custom(function = "validate_emails"))]
    pub emails: String,
    #[validate(required)]
    pub print: Option<bool>,
}

impl TaskPayload {
    /// Space with blanks treated as the default space.
    pub fn space(&self) -> Option<String> {
        self.space
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    /// Recipients, trimmed and comma-joined.
    pub fn normalized_emails(&self) -> String {
        split_list(&self.emails).join(",")
    }
}

/// `user` query parameter every reporting route runs as.
#[derive(Debug, Clone, Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

/// Extra fields attached to the activity record of a request.
#[derive(Debug, Clone)]
pub struct ActivityMetadata(pub Value);

fn failure(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Owned(message))
}

fn validate_guid(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(failure("required", "dashboardId is required".into()));
    }
    Uuid::parse_str(value.trim())
        .map(|_| ())
        .map_err(|_| failure("guid", format!("'{}' is not a valid GUID", value)))
}

fn validate_frequency(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(failure("required", "frequency is required".into()));
    }
    if Frequency::new(value).is_valid() {
        return Ok(());
    }
    let known: Vec<&str> = Frequency::known().collect();
    Err(failure(
        "frequency",
        format!("'{}' is not one of {}", value, known.join(", ")),
    ))
}

fn validate_emails(value: &str) -> Result<(), ValidationError> {
    let addresses = split_list(value);
    if addresses.is_empty() {
        return Err(failure("required", "at least one recipient is required".into()));
    }
    match addresses.iter().find(|a| !a.validate_email()) {
        Some(invalid) => Err(failure("email", format!("'{}' is not a valid address", invalid))),
        None => Ok(()),
    }
}
