//! HTTP front door: JSON envelopes around the pipeline and the store.

pub mod routes;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::pipeline::Pipeline;

pub use routes::api_routes;

/// Shared state for all routes.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
    /// Raised on shutdown; batch runs stop between emails.
    pub cancel: Arc<AtomicBool>,
}

/// `{"success": true, "data": ...}`
pub fn success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true, "data": data })),
    )
        .into_response()
}

/// `{"success": false, "error": ..., "details": ...}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>, details: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            details: Some(details.to_string()),
        }
    }

    pub fn internal(error: impl Into<String>, details: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            details: Some(details.to_string()),
        }
    }

    pub fn bad_gateway(error: impl Into<String>, details: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            error: error.into(),
            details: Some(details.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "success": false, "error": self.error });
        if let Some(details) = self.details {
            body["details"] = serde_json::Value::String(details);
        }
        (self.status, Json(body)).into_response()
    }
}
