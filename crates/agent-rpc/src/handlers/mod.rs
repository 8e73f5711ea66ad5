//! Request handlers for the instrument web API.

pub mod instrument;
pub mod locks;
mod shared;

pub use shared::{ApiError, ApiResult, RequestParams};

use axum::{response::IntoResponse, Json};
use serde_json::json;

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
