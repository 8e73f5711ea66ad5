//! Driver command handlers.

use super::shared::{lockout, ApiResult, RequestParams};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use instrument_agent::registry::{list_drivers as registered_drivers, port_agents, PortAgentInfo};
use instrument_agent::AgentError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const DEFAULT_RESOURCE: &str = "DRIVER_PARAMETER_ALL";

fn object_param(params: &RequestParams, name: &str, required: bool) -> ApiResult<Map<String, Value>> {
    match params.get(name) {
        Some(Value::Object(map)) => Ok(map.clone()),
        None if !required => Ok(Map::new()),
        _ => Err(AgentError::Validation {
            field: name.to_string(),
            message: format!("{} must be an object", name),
        }
        .into()),
    }
}

pub async fn list_drivers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(registered_drivers(state.registry.as_ref()).await?))
}

/// Driver state with the current lock holder under `locked-by`.
pub async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let locker = state.locks.check(&driver_id).await?;
    let client = state.driver_client(&driver_id).await?;
    let mut reply = client.get_state(None).await?;
    if let Value::Object(map) = &mut reply {
        map.insert("locked-by".to_string(), locker.map(Value::String).unwrap_or(Value::Null));
    }
    Ok(Json(reply))
}

pub async fn get_port_agent(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> ApiResult<Json<BTreeMap<String, PortAgentInfo>>> {
    Ok(Json(port_agents(state.registry.as_ref(), &driver_id).await?))
}

pub async fn ping(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(client.ping(None).await?))
}

pub async fn discover(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(client.discover(Some(params.timeout()?)).await?))
}

pub async fn set_init_params(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    let config = params.get("config").cloned().unwrap_or(Value::Null);
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(
        client
            .set_init_params(config, Some(params.timeout()?))
            .await?,
    ))
}

pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    let resource = params
        .get("resource")
        .cloned()
        .unwrap_or_else(|| Value::String(DEFAULT_RESOURCE.to_string()));
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(
        client
            .get_resource(resource, Some(params.timeout()?))
            .await?,
    ))
}

pub async fn set_resource(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    let resource = object_param(&params, "resource", true)?;
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(
        client
            .set_resource(&resource, Some(params.timeout()?))
            .await?,
    ))
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    let command = params.require_string("command")?;
    let kwargs = object_param(&params, "kwargs", false)?;
    let timeout = params.timeout()?;
    info!("Execute {} on {}", command, driver_id);
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(client.execute(&command, kwargs, Some(timeout)).await?))
}

pub async fn shutdown(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    info!("Shutdown requested for {}", driver_id);
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(client.shutdown(None).await?))
}

pub async fn set_log_level(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    params: RequestParams,
) -> ApiResult<Json<Value>> {
    lockout(&state, &driver_id, &params).await?;
    let level = params.get("level").cloned().unwrap_or(Value::Null);
    let client = state.driver_client(&driver_id).await?;
    Ok(Json(
        client
            .set_log_level(level, Some(params.timeout()?))
            .await?,
    ))
}
