//! Shared handler utilities: request parameters, error responses and the
//! lock guard.

use crate::server::AppState;
use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use instrument_agent::config::DriverConfig;
use instrument_agent::AgentError;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Error returned by handlers, rendered with the status from
/// [`AgentError::status_code`].
#[derive(Debug)]
pub struct ApiError(pub AgentError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &self.0 {
            AgentError::Locked { holder } => json!({ "locked-by": holder }),
            AgentError::Timeout(_) => json!({ "timeout": self.0.to_string() }),
            AgentError::ParameterValidation(errors) => json!(errors),
            other => json!({ "error": other.to_string() }),
        };

        if status.is_server_error() {
            warn!("Request failed ({}): {}", status, self.0);
        } else {
            debug!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(body)).into_response()
    }
}

/// Request parameters gathered from the query string, a form body or a JSON
/// body, in that order of preference.
///
/// Query and form values are JSON-decoded when they parse, so `config={"a":1}`
/// arrives as an object and `timeout=500` as a number.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    values: Map<String, Value>,
}

impl RequestParams {
    pub fn parse(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> Self {
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            return Self::from_pairs(query.as_bytes());
        }
        if body.is_empty() {
            return Self::default();
        }
        let is_form = content_type
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            return Self::from_pairs(body);
        }
        match serde_json::from_slice(body) {
            Ok(Value::Object(values)) => Self { values },
            _ => Self::default(),
        }
    }

    fn from_pairs(encoded: &[u8]) -> Self {
        let mut values = Map::new();
        for (name, raw) in url::form_urlencoded::parse(encoded) {
            let value = serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw.into_owned()));
            values.entry(name.into_owned()).or_insert(value);
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    /// Parameter as text; numbers and booleans are rendered.
    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn require_string(&self, name: &str) -> ApiResult<String> {
        self.get_string(name).ok_or_else(|| {
            AgentError::Validation {
                field: name.to_string(),
                message: format!("Missing required parameter: {}", name),
            }
            .into()
        })
    }

    /// The `timeout` parameter in milliseconds, or the web default.
    pub fn timeout(&self) -> ApiResult<Duration> {
        let millis = match self.get("timeout") {
            None => Some(DriverConfig::REQUEST_TIMEOUT_MS),
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        millis.map(Duration::from_millis).ok_or_else(|| {
            AgentError::Validation {
                field: "timeout".to_string(),
                message: "timeout must be a non-negative integer (milliseconds)".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl<S> FromRequest<S> for RequestParams
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let query = req.uri().query().map(str::to_owned);
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = Bytes::from_request(req, state).await.map_err(|e| {
            ApiError(AgentError::Validation {
                field: "body".to_string(),
                message: e.body_text(),
            })
        })?;
        Ok(Self::parse(query.as_deref(), content_type.as_deref(), &body))
    }
}

/// Refuse the request if the driver is locked by someone other than the
/// request's `key`.
pub(crate) async fn lockout(
    state: &AppState,
    driver_id: &str,
    params: &RequestParams,
) -> ApiResult<()> {
    match state.locks.check(driver_id).await? {
        None => Ok(()),
        Some(holder) if params.get_string("key").as_deref() == Some(holder.as_str()) => Ok(()),
        Some(holder) => Err(AgentError::Locked { holder }.into()),
    }
}
