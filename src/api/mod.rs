pub mod dto;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::activity::{ActivityContext, ActivityLogger, RequestSnapshot};
use crate::api::dto::{ActivityMetadata, TaskPayload, UserQuery};
use crate::domain::{HistoryEntry, Privilege, ReportingTask};
use crate::elastic::PrivilegeChecker;
use crate::errors::AppError;
use crate::service::ReportingService;
use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{FromRequest, MatchedPath, Path, Query, Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};

use uuid::Uuid;
use validator::Validate;


#[derive(Clone)]
pub struct AppState {
    pub service: ReportingService,
    pub activity: ActivityLogger,
    pub privileges: Arc<dyn PrivilegeChecker>,
    /// Index the privileges are checked against.
    pub reporting_index: String,
}

impl AppState {
    pub fn new(
        service: ReportingService,
        activity: ActivityLogger,
        privileges: Arc<dyn PrivilegeChecker>,
        reporting_index: impl Into<String>,
    ) -> Self {
        Self {
            service,
            activity,
            privileges,
            reporting_index: reporting_index.into(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct MakeUuidRequest;

impl MakeRequestId for MakeUuidRequest {
    fn make_request_id<B>(&mut self, _: &axum::http::Request<B>) -> Option<RequestId> {
        let uuid = Uuid::new_v4().to_string();

        let header_value =
            HeaderValue::from_str(&uuid).unwrap_or(HeaderValue::from_static("invalid-uuid"));

        Some(RequestId::new(header_value))
    }
}

/// Build the application router with all routes and middleware
///
/// Every route is gated by [`require_privilege`] and recorded by
/// [`record_activity`], denied requests included. Both are route layers, so
/// unrouted paths get a plain 404 and leave no activity behind.
pub fn router(state: AppState) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route(
            "/tasks",
            get(list_tasks)
                .post(create_task)
                .patch(missing_task_id)
                .delete(missing_task_id),
        )
        // `{id}` is the space on GET and the task id(s) otherwise
        .route(
            "/tasks/{id}",
            get(list_space_tasks).patch(update_task).delete(delete_tasks),
        )
        .route("/tasks/{id}/history", get(task_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_privilege,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            record_activity,
        ))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let req_id = request
                        .extensions()
                        .get::<RequestId>()
                        .map(|id| id.header_value().to_str().unwrap_or("bad-ascii"))
                        .unwrap_or("unknown");

                    tracing::info_span!(
                        "http_request",
                        request_id = %req_id,
                        method = ?request.method(),
                        uri = ?request.uri(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeUuidRequest))
}

/// JSON body extractor whose rejections are reported as validation errors.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(AppError::invalid_field(
                "body",
                "json",
                rejection.body_text(),
            )),
        }
    }
}

fn user_of(req: &Request) -> Option<String> {
    Query::<UserQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.user)
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
}

fn required_privilege(method: &Method) -> Privilege {
    match *method {
        Method::POST => Privilege::Create,
        Method::PATCH | Method::PUT => Privilege::Write,
        Method::DELETE => Privilege::Delete,
        _ => Privilege::Read,
    }
}

/// Checks that the `user` query parameter holds the privilege matching the
/// request method on the reporting index. The handler does not run otherwise.
async fn require_privilege(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = user_of(&req).ok_or_else(|| {
        AppError::invalid_field("user", "required", "user query parameter is required")
    })?;
    let privilege = required_privilege(req.method());

    let granted = state
        .privileges
        .has_privilege(&user, &state.reporting_index, privilege)
        .await?;

    if !granted {
        tracing::warn!(%user, privilege = privilege.as_str(), "Access denied");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(req).await)
}

fn action_of(method: &Method, path: &str) -> &'static str {
    match *method {
        Method::POST => "reporting/store",
        Method::PATCH | Method::PUT => "reporting/update",
        Method::DELETE => "reporting/delete",
        _ if path.ends_with("/history") => "reporting/history",
        _ => "reporting/list",
    }
}

/// Records every answered call in the activity table.
async fn record_activity(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started_at = state.service.clock().now();
    let timer = Instant::now();

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let action = action_of(req.method(), &path);
    let username = user_of(&req);
    let query = Query::<BTreeMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();
    let request = RequestSnapshot {
        method: req.method().to_string(),
        url: req.uri().to_string(),
        query,
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    let response = next.run(req).await;
    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("Failed to buffer response body: {}", e);
            Bytes::new()
        }
    };

    let ctx = ActivityContext {
        started_at,
        action: action.to_string(),
        response_time_ms: timer.elapsed().as_millis() as i64,
        metadata: parts
            .extensions
            .get::<ActivityMetadata>()
            .map(|m| m.0.clone())
            .unwrap_or_else(|| json!({})),
        request,
        status: parts.status.as_u16(),
        body: serde_json::from_slice(&bytes).ok(),
        username,
    };

    if let Err(e) = state.activity.save(ctx).await {
        tracing::error!(%action, "Failed to save activity: {:?}", e);
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn parse_task_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        AppError::invalid_field("taskId", "guid", format!("'{}' is not a valid task id", raw))
    })
}

/// Parses the id of an updated task. A bad id and a bad body are reported together.
fn parse_update_id(raw: &str, payload: &TaskPayload) -> Result<Uuid, AppError> {
    parse_task_id(raw).map_err(|e| match (e, payload.validate()) {
        (AppError::Validation(mut errors), Err(body)) => {
            errors.errors_mut().extend(body.into_errors());
            AppError::Validation(errors)
        }
        (e, _) => e,
    })
}

fn metadata(value: Value) -> Extension<ActivityMetadata> {
    Extension(ActivityMetadata(value))
}

/// Handler to list the live tasks of every space
async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<ReportingTask>>, AppError> {
    Ok(Json(state.service.list_tasks(None).await?))
}

async fn list_space_tasks(
    State(state): State<AppState>,
    Path(space): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tasks = state.service.list_tasks(Some(&space)).await?;

    Ok((metadata(json!({ "space": space })), Json(tasks)))
}

/// Handler to create a new reporting task
///
/// # Errors
///
/// * `AppError::Validation` - If the body is malformed or a field is invalid
async fn create_task(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<TaskPayload>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.service.create_task(payload).await?;

    Ok((
        StatusCode::CREATED,
        metadata(json!({ "taskId": task.id })),
        Json(task),
    ))
}

/// Handler to update a reporting task
///
/// # Errors
///
/// * `AppError::Validation` - If the id or the body is invalid
/// * `AppError::NotFound` - If no live task has this id
async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<TaskPayload>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = parse_update_id(&id, &payload)?;
    let task = state.service.update_task(task_id, payload).await?;

    Ok((metadata(json!({ "taskId": task.id })), Json(task)))
}

/// Handler to delete one task, or several given as a comma-separated list
///
/// # Errors
///
/// * `AppError::NotFound` - If none of the tasks was live
async fn delete_tasks(
    State(state): State<AppState>,
    Path(ids): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task_ids = ids
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_task_id)
        .collect::<Result<Vec<_>, _>>()?;

    if task_ids.is_empty() {
        return Err(AppError::invalid_field(
            "taskId",
            "required",
            "taskId is required",
        ));
    }

    state.service.delete_tasks(&task_ids).await?;

    let meta = match task_ids.as_slice() {
        [single] => json!({ "taskId": single }),
        many => json!({ "taskIds": many }),
    };

    Ok((StatusCode::NO_CONTENT, metadata(meta)))
}

async fn task_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = parse_task_id(&id)?;
    let history: Vec<HistoryEntry> = state.service.history(task_id).await?;

    Ok((metadata(json!({ "taskId": task_id })), Json(history)))
}

async fn missing_task_id() -> AppError {
    AppError::invalid_field("taskId", "required", "taskId is required")
}
