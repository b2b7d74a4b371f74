//! Result envelope.
//!
//! Every tool invocation returns exactly one of two shapes:
//! `{"success": true, ...result}` or `{"success": false, "error": message}`.

use serde::Serialize;
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::errors::AppError;

/// Normalized response for a tool invocation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolEnvelope {
    /// Whether the invocation succeeded.
    pub success: bool,

    /// Error message (present on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Error class code (present on failure), e.g. `NOT_FOUND`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Result fields, flattened into the envelope on success.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
}

impl ToolEnvelope {
    /// Wraps a serializable result. Objects are flattened into the envelope;
    /// any other value lands under `result`.
    pub fn success<T: Serialize>(result: T) -> Self {
        let mut data = match serde_json::to_value(result) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
            Err(e) => return Self::failure(&AppError::Internal(e.to_string())),
        };
        // A result must not be able to flip the envelope flag.
        data.remove("success");
        data.remove("error");
        data.remove("code");

        Self {
            success: true,
            error: None,
            code: None,
            data,
        }
    }

    /// Builds a failure envelope from an error.
    pub fn failure(err: &AppError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
            data: Map::new(),
        }
    }

    /// Looks up a flattened result field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_flattens_result_fields() {
        let env = ToolEnvelope::success(json!({"tables": ["a", "b"]}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"success": true, "tables": ["a", "b"]}));
    }

    #[test]
    fn test_failure_carries_message_and_code() {
        let env = ToolEnvelope::failure(&AppError::UnknownTool("drop_everything".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("Tool 'drop_everything' not found"));
        assert_eq!(value["code"], json!("UNKNOWN_TOOL"));
    }

    #[test]
    fn test_result_cannot_override_success_flag() {
        let env = ToolEnvelope::success(json!({"success": false, "count": 3}));
        assert!(env.success);
        assert_eq!(env.get("count"), Some(&json!(3)));
        assert!(env.get("success").is_none());
    }
}
