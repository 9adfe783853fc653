//! REST endpoints.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ApiError, ApiState, success};
use crate::channels::FetchFilter;
use crate::error::PipelineError;
use crate::pipeline::types::{Attachment, Email};
use crate::store::TaskStatus;

const DEFAULT_MAX_EMAILS: usize = 10;
const MAX_EMAILS_LIMIT: usize = 100;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_READ_LIMIT: usize = 1000;

/// Build the API router. Every endpoint answers both bare and under `/api`.
pub fn api_routes(state: ApiState) -> Router {
    let endpoints = Router::new()
        .route("/health", get(health))
        .route("/process_email", post(process_email))
        .route("/run_agent", post(run_agent))
        .route("/history", get(history))
        .route("/tasks", get(tasks))
        .route("/workflow_logs", get(workflow_logs));

    Router::new()
        .merge(endpoints.clone())
        .nest("/api", endpoints)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> Response {
    success(serde_json::json!({
        "status": "healthy",
        "service": "mail-triage",
        "version": env!("CARGO_PKG_VERSION"),
        "mock_mode": state.pipeline.engine().is_mock(),
        "source": state.pipeline.source().name(),
    }))
}

// ── Processing ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AttachmentRequest {
    filename: String,
    #[serde(default)]
    mime_type: Option<String>,
    /// Inline text content.
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ProcessEmailRequest {
    #[serde(default)]
    email_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    attachments: Vec<AttachmentRequest>,
}

impl From<ProcessEmailRequest> for Email {
    fn from(req: ProcessEmailRequest) -> Self {
        let email_id = req
            .email_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("api_{}", Uuid::new_v4().simple()));
        let attachments = req
            .attachments
            .into_iter()
            .map(|a| {
                let attachment = Attachment::new(a.filename, a.content.into_bytes());
                match a.mime_type {
                    Some(mime) => attachment.with_mime_type(mime),
                    None => attachment,
                }
            })
            .collect();
        let mut email = Email::new(email_id, req.sender, req.subject, req.body).with_attachments(attachments);
        email.thread_id = req.thread_id;
        email
    }
}

async fn process_email(
    State(state): State<ApiState>,
    payload: Result<Json<ProcessEmailRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request("Invalid request body", e.body_text()))?;
    let email = Email::from(req);
    match state.pipeline.run_one(&email).await {
        Ok(outcome) => Ok(success(outcome)),
        Err(PipelineError::Validation(e)) => {
            warn!(email_id = %email.email_id, error = %e, "Rejected invalid email");
            Err(ApiError::bad_request("Invalid email", e))
        }
        Err(e) => {
            error!(email_id = %email.email_id, error = %e, "Email processing failed");
            Err(ApiError::internal("Failed to process email", e))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunAgentRequest {
    #[serde(default)]
    max_emails: Option<usize>,
    /// Raw IMAP search criteria; unseen messages when absent.
    #[serde(default)]
    criteria: Option<String>,
}

async fn run_agent(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let req: RunAgentRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunAgentRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request("Invalid request body", e))?
    };

    let max_emails = req.max_emails.unwrap_or(DEFAULT_MAX_EMAILS);
    if !(1..=MAX_EMAILS_LIMIT).contains(&max_emails) {
        return Err(ApiError::bad_request(
            "Invalid request. max_emails must be between 1 and 100.",
            format!("got {max_emails}"),
        ));
    }
    let filter = match req.criteria {
        Some(raw) if !raw.trim().is_empty() => FetchFilter::Search(raw),
        _ => FetchFilter::Unseen,
    };

    info!(max_emails, criteria = filter.criteria(), "Running agent");
    match state
        .pipeline
        .run_from_source(&filter, max_emails, &state.cancel)
        .await
    {
        Ok(summary) => Ok(success(summary)),
        Err(e) => {
            error!(error = %e, "Agent run failed");
            Err(ApiError::bad_gateway("Failed to fetch emails", e))
        }
    }
}

// ── Reads ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<String>,
}

/// Out-of-range or unparseable limits fall back to the default; large
/// ones are clamped.
fn read_limit(raw: Option<&str>, default: usize) -> usize {
    match raw.and_then(|s| s.trim().parse::<usize>().ok()) {
        Some(0) | None => default,
        Some(n) => n.min(MAX_READ_LIMIT),
    }
}

async fn history(State(state): State<ApiState>, Query(q): Query<LimitQuery>) -> Result<Response, ApiError> {
    let limit = read_limit(q.limit.as_deref(), DEFAULT_HISTORY_LIMIT);
    let entries = state
        .pipeline
        .store()
        .history(limit)
        .await
        .map_err(|e| ApiError::internal("Failed to retrieve email history", e))?;
    Ok(success(serde_json::json!({ "count": entries.len(), "history": entries })))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    status: Option<String>,
}

async fn tasks(State(state): State<ApiState>, Query(q): Query<TaskQuery>) -> Result<Response, ApiError> {
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request(
                "Invalid status filter",
                format!("'{raw}' (expected pending, in_progress or completed)"),
            )
        })?),
        None => None,
    };
    let tasks = state
        .pipeline
        .store()
        .tasks(status)
        .await
        .map_err(|e| ApiError::internal("Failed to retrieve tasks", e))?;
    Ok(success(serde_json::json!({ "count": tasks.len(), "tasks": tasks })))
}

async fn workflow_logs(State(state): State<ApiState>, Query(q): Query<LimitQuery>) -> Result<Response, ApiError> {
    let limit = read_limit(q.limit.as_deref(), DEFAULT_LOG_LIMIT);
    let logs = state
        .pipeline
        .store()
        .workflow_logs(limit)
        .await
        .map_err(|e| ApiError::internal("Failed to retrieve workflow logs", e))?;
    Ok(success(serde_json::json!({ "count": logs.len(), "logs": logs })))
}

async fn not_found() -> impl IntoResponse {
    ApiError {
        status: axum::http::StatusCode::NOT_FOUND,
        error: "Endpoint not found".into(),
        details: None,
    }
}
