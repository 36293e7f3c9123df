//! Tool argument decoding

use crate::core::service::ServiceError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Deserialize tool arguments into a typed parameter struct
///
/// Missing arguments (`null`) are treated as an empty object so tools whose
/// parameters are all optional can be called without any.
pub fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ServiceError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        Value::Object(_) => arguments,
        other => {
            return Err(ServiceError::invalid(format!(
                "tool arguments must be an object, got {}",
                type_name(&other)
            )));
        }
    };
    serde_json::from_value(arguments).map_err(|e| ServiceError::invalid(e.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reject empty strings for required text parameters
pub fn require_non_empty(name: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        Err(ServiceError::invalid(format!("'{}' must not be empty", name)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Params {
        name: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    struct AllOptional {
        #[serde(default)]
        region: Option<String>,
    }

    #[test]
    fn test_parse_args() {
        let params: Params = parse_args(json!({"name": "a", "limit": 5})).unwrap();
        assert_eq!(params.name, "a");
        assert_eq!(params.limit, Some(5));
    }

    #[test]
    fn test_parse_args_missing_field() {
        let err = parse_args::<Params>(json!({})).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(ref m) if m.contains("name")));
    }

    #[test]
    fn test_parse_args_null_is_empty_object() {
        let params: AllOptional = parse_args(Value::Null).unwrap();
        assert!(params.region.is_none());
        assert!(parse_args::<AllOptional>(json!([1])).is_err());
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("query", "x").is_ok());
        assert!(require_non_empty("query", "  ").is_err());
    }
}
