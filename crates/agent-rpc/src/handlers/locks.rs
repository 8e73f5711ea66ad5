//! Driver lock handlers.

use super::shared::{ApiResult, RequestParams};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use instrument_agent::AgentError;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn list_locks(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let locks = state.locks.list().await?;
    Ok(Json(json!({ "locks": locks })))
}

pub async fn get_lock(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let holder = state.locks.check(&driver_id).await?;
    Ok(Json(json!({ "locked-by": holder })))
}

/// Lock the driver for `key`. Responds 409 with the holder if someone else
/// already has it.
pub async fn set_lock(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    let key = params.require_string("key")?;
    let holder = state.locks.set(&driver_id, &key).await?;
    if holder != key {
        return Err(AgentError::Locked { holder }.into());
    }
    Ok(Json(json!({ "locked-by": holder })))
}

/// Clear the driver lock. When a `key` is supplied it must match the holder.
pub async fn unlock(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    let key = params.get_string("key");
    let after = state.locks.delete_if(&driver_id, key.as_deref()).await?;
    Ok(Json(json!({ "locked-by": after })))
}
