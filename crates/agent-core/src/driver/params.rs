//! Parameter validation and timeouts derived from driver metadata.
//!
//! Drivers publish their capabilities in the `overall_state` reply under
//! `value.metadata`:
//!
//! ```json
//! {"value": {"metadata": {
//!     "commands":   {"DRIVER_EVENT_ACQUIRE_SAMPLE": {"timeout": 30}},
//!     "parameters": {"interval": {"visibility": "READ_WRITE",
//!                                 "value": {"type": "int"},
//!                                 "range": [1, 3600]}}
//! }}}
//! ```

use crate::config::DriverConfig;
use crate::{AgentError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

/// Declared type of a driver parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Bool,
    Int,
    Float,
}

impl ParameterType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ParameterType::String),
            "bool" => Some(ParameterType::Bool),
            "int" => Some(ParameterType::Int),
            "float" => Some(ParameterType::Float),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Bool => "bool",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
        }
    }
}

fn metadata<'a>(state: &'a Value, section: &str) -> Option<&'a Map<String, Value>> {
    state
        .get("value")?
        .get("metadata")?
        .get(section)?
        .as_object()
}

/// Timeout for `command` advertised in an `overall_state` reply.
///
/// Metadata timeouts are in seconds; absent entries fall back to
/// [`DriverConfig::METADATA_TIMEOUT_SECS`].
pub fn command_timeout(state: &Value, command: &str) -> Duration {
    let secs = metadata(state, "commands")
        .and_then(|commands| commands.get(command))
        .and_then(|entry| entry.get("timeout"))
        .and_then(Value::as_f64)
        .filter(|secs| secs.is_finite() && *secs >= 0.0);

    match secs {
        Some(secs) => Duration::from_secs_f64(secs),
        None => Duration::from_secs(DriverConfig::METADATA_TIMEOUT_SECS),
    }
}

/// Coerce a request value to a parameter type.
///
/// Returns `None` when the value cannot represent the type (including an
/// unknown or missing type).
pub fn coerce_value(value: &Value, ptype: Option<ParameterType>) -> Option<Value> {
    match ptype? {
        ParameterType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            other => Some(Value::String(other.to_string())),
        },
        ParameterType::Bool => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            Value::String(s) => match s.as_str() {
                "true" | "True" => Some(Value::Bool(true)),
                "false" | "False" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParameterType::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ParameterType::Float => match value {
            Value::Number(n) => n.as_f64().map(Value::from),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from),
            _ => None,
        },
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn in_range(value: &Value, range: &Value) -> std::result::Result<(), String> {
    match range {
        Value::Array(bounds) => {
            let (Some(min), Some(max)) = (bounds.first(), bounds.last()) else {
                return Ok(());
            };
            let above_min = matches!(
                compare(value, min),
                Some(Ordering::Greater | Ordering::Equal)
            );
            let below_max = matches!(compare(value, max), Some(Ordering::Less | Ordering::Equal));
            if above_min && below_max {
                Ok(())
            } else {
                Err(format!("outside valid range ({})", range))
            }
        }
        Value::Object(choices) => {
            if choices
                .values()
                .any(|choice| compare(value, choice) == Some(Ordering::Equal))
            {
                Ok(())
            } else {
                let allowed = Value::Array(choices.values().cloned().collect());
                Err(format!("not one of ({})", allowed))
            }
        }
        _ => Ok(()),
    }
}

/// Validate `parameters` against the parameter metadata of an
/// `overall_state` reply and return them coerced to their declared types.
///
/// Every parameter is checked; all failures are reported together in
/// [`AgentError::ParameterValidation`].
pub fn validate_parameters(state: &Value, parameters: &Map<String, Value>) -> Result<Map<String, Value>> {
    let empty = Map::new();
    let declared = metadata(state, "parameters").unwrap_or(&empty);

    let mut errors = BTreeMap::new();
    let mut out = Map::new();

    for (name, value) in parameters {
        let meta = declared.get(name);
        let writable = meta
            .and_then(|m| m.get("visibility"))
            .and_then(Value::as_str)
            == Some("READ_WRITE");
        if !writable {
            errors.insert(name.clone(), format!("Parameter({}) not writeable", name));
            continue;
        }

        let type_name = meta
            .and_then(|m| m.get("value"))
            .and_then(|v| v.get("type"))
            .and_then(Value::as_str);
        let Some(coerced) = coerce_value(value, type_name.and_then(ParameterType::from_name)) else {
            errors.insert(
                name.clone(),
                format!(
                    "Parameter({}) unable to coerce to {} ({})",
                    name,
                    type_name.unwrap_or("unknown type"),
                    value
                ),
            );
            continue;
        };

        if let Some(range) = meta.and_then(|m| m.get("range")) {
            if let Err(reason) = in_range(&coerced, range) {
                errors.insert(name.clone(), format!("Parameter({}) {} ({})", name, reason, value));
                continue;
            }
        }

        out.insert(name.clone(), coerced);
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(AgentError::ParameterValidation(errors))
    }
}
