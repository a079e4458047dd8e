//! Task submission, status and results endpoints.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use checker_core::webhook::parse_ttl;
use checker_core::{ApiKey, EmailReport, Task, TaskStatus, WebhookConfig};

use crate::error::ApiError;
use crate::AppState;

/// Upper bound on batch size.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Upper bound on a single email address.
pub const MAX_EMAIL_LEN: usize = 254;

/// Default and maximum page size for results.
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub emails: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskWithWebhookRequest {
    pub emails: Vec<String>,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub status: TaskStatus,
    pub total_results: usize,
    pub created_at: DateTime<Utc>,
    pub total_pages: i64,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub data: Vec<EmailReport>,
    pub page: i64,
    pub total: usize,
}

/// Unique task id: UUID plus a nanosecond timestamp suffix.
fn generate_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{}", Uuid::new_v4(), nanos)
}

fn check_batch(emails: &[String], key: Option<&ApiKey>) -> Result<(), ApiError> {
    if emails.len() > MAX_BATCH_SIZE {
        return Err(ApiError::bad_request("Too many emails (max 10000)"));
    }
    if emails.iter().any(|email| email.len() > MAX_EMAIL_LEN) {
        return Err(ApiError::bad_request("Email too long"));
    }
    if let Some(key) = key {
        if emails.len() as i64 > key.remaining_checks {
            return Err(ApiError::Forbidden("Not enough remaining checks".into()));
        }
    }
    Ok(())
}

async fn submit(state: &AppState, task: Task) -> Result<Json<serde_json::Value>, ApiError> {
    let task_id = task.id.clone();
    state.store.save_task(&task).await?;
    state.store.enqueue_task(&task).await?;
    info!(%task_id, emails = task.emails.len(), "task accepted");
    Ok(Json(json!({ "task_id": task_id })))
}

/// POST /tasks
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    key: Option<Extension<ApiKey>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = key.map(|Extension(key)| key);
    check_batch(&request.emails, key.as_ref())?;

    let api_key = key.map(|k| k.key).unwrap_or_default();
    let task = Task::new(generate_id(), request.emails, api_key);
    submit(&state, task).await
}

/// POST /tasks-with-webhook
pub async fn create_task_with_webhook(
    State(state): State<Arc<AppState>>,
    key: Option<Extension<ApiKey>>,
    Json(request): Json<CreateTaskWithWebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = key.map(|Extension(key)| key);
    check_batch(&request.emails, key.as_ref())?;
    validate_webhook(&request.webhook)?;

    let api_key = key.map(|k| k.key).unwrap_or_default();
    let mut task = Task::new(generate_id(), request.emails, api_key);
    task.webhook = Some(request.webhook);
    submit(&state, task).await
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ApiError> {
    if webhook.url.is_empty() {
        return Err(ApiError::bad_request("Invalid webhook config"));
    }
    if !(1..=5).contains(&webhook.retries) {
        return Err(ApiError::bad_request("Webhook retries must be 1..5"));
    }
    parse_ttl(&webhook.ttl)
        .map_err(|_| ApiError::bad_request("Invalid TTL format (e.g., '1h', '30m')"))?;
    Ok(())
}

/// GET /tasks/{id}
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.store.get_task(&id).await?;

    let total_pages = if task.status == TaskStatus::Completed {
        (task.results.len() as i64 + MAX_PER_PAGE - 1) / MAX_PER_PAGE
    } else {
        0
    };

    Ok(Json(TaskStatusResponse {
        status: task.status,
        total_results: task.results.len(),
        created_at: task.created_at,
        total_pages,
    }))
}

/// GET /tasks-results/{id}?page&per_page
pub async fn task_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let task = state.store.get_task(&id).await?;
    let (page, per_page) = clamp_pagination(query.page, query.per_page);

    let total = task.results.len();
    let start = (((page - 1) * per_page) as usize).min(total);
    let end = (start + per_page as usize).min(total);

    Ok(Json(ResultsResponse {
        data: task.results[start..end].to_vec(),
        page,
        total,
    }))
}

/// Defaults are page 1 with 100 results; `per_page` is clamped to
/// `[1, 100]` and non-positive pages fall back to 1.
pub(crate) fn clamp_pagination(page: Option<i64>, per_page: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p > 0).unwrap_or(1);
    let per_page = per_page.unwrap_or(MAX_PER_PAGE).clamp(1, MAX_PER_PAGE);
    (page, per_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pagination_defaults_and_clamping() {
        assert_eq!(clamp_pagination(None, None), (1, 100));
        assert_eq!(clamp_pagination(Some(0), Some(0)), (1, 1));
        assert_eq!(clamp_pagination(Some(-3), Some(250)), (1, 100));
        assert_eq!(clamp_pagination(Some(2), Some(50)), (2, 50));
    }

    #[test]
    fn batch_bounds() {
        let ok: Vec<String> = vec!["a@b.test".into()];
        assert!(check_batch(&ok, None).is_ok());

        let too_many: Vec<String> = (0..=MAX_BATCH_SIZE).map(|i| format!("u{i}@b.test")).collect();
        assert!(matches!(
            check_batch(&too_many, None),
            Err(ApiError::BadRequest(_))
        ));

        let long_email = vec![format!("{}@b.test", "a".repeat(255))];
        assert!(matches!(
            check_batch(&long_email, None),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn admission_respects_quota() {
        let key = ApiKey {
            key: "k".into(),
            key_type: checker_core::KeyType::PayAsYouGo,
            initial_checks: 10,
            used_checks: 8,
            remaining_checks: 2,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(1),
            last_topup: None,
        };

        let two: Vec<String> = vec!["a@b.test".into(), "b@b.test".into()];
        assert!(check_batch(&two, Some(&key)).is_ok());

        let three: Vec<String> = vec!["a@b.test".into(), "b@b.test".into(), "c@b.test".into()];
        assert!(matches!(
            check_batch(&three, Some(&key)),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn webhook_validation() {
        let valid = WebhookConfig {
            url: "https://hooks.example/x".into(),
            ttl: "1h".into(),
            retries: 3,
            secret: None,
        };
        assert!(validate_webhook(&valid).is_ok());

        let mut bad = valid.clone();
        bad.url = String::new();
        assert!(validate_webhook(&bad).is_err());

        let mut bad = valid.clone();
        bad.retries = 0;
        assert!(validate_webhook(&bad).is_err());

        let mut bad = valid.clone();
        bad.retries = 6;
        assert!(validate_webhook(&bad).is_err());

        let mut bad = valid;
        bad.ttl = "soon".into();
        assert!(validate_webhook(&bad).is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(a.len() > 36);
    }
}
