//! Canonical identity of a `(query, arguments)` pair.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, TransportError};
use crate::types::{FunctionPath, QueryCacheKey};

/// Converts caller arguments into the JSON object sent over the wire.
///
/// Unit / `null` becomes `{}`; anything else that is not an object is rejected.
pub fn normalize_args<A: Serialize + ?Sized>(args: &A) -> Result<Value> {
    let value = serde_json::to_value(args)
        .map_err(|e| TransportError::lookup(format!("arguments are not serializable: {e}")))?;

    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(value),
        other => Err(TransportError::lookup(format!(
            "arguments must be an object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Builds the cache key for already-normalized arguments.
///
/// Object keys are sorted and numbers canonicalized, so two semantically
/// equal argument values always produce the same key.
pub fn encode(path: &FunctionPath, args: &Value) -> Result<QueryCacheKey> {
    if path.is_blank() {
        return Err(TransportError::lookup("function path is empty"));
    }
    let args_canonical = serde_jcs::to_string(args)
        .map_err(|e| TransportError::lookup(format!("arguments cannot be canonicalized: {e}")))?;

    Ok(QueryCacheKey {
        path: path.clone(),
        args_canonical: Arc::from(args_canonical.as_str()),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
