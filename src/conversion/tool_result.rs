//! Handler output to MCP tool results

use crate::core::service::ServiceError;
use crate::models::mcp::ToolCallResult;
use serde_json::{Value, json};

/// Convert a handler result into a `tools/call` result
///
/// Strings are returned as-is, other values as pretty-printed JSON. Errors
/// become `isError` results carrying the error message.
pub fn tool_result(result: Result<Value, ServiceError>, limit: usize) -> ToolCallResult {
    match result {
        Ok(Value::String(text)) => ToolCallResult::text(truncate_output(&text, limit), false),
        Ok(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            ToolCallResult::text(truncate_output(&text, limit), false)
        }
        Err(e) => ToolCallResult::text(truncate_output(&e.to_string(), limit), true),
    }
}

/// In-band error body used by servers that report failures as data
pub fn error_payload(err: &ServiceError) -> Value {
    json!({
        "success": false,
        "error": err.to_string(),
    })
}

/// Cut `text` to at most `limit` bytes on a char boundary, appending a marker
pub fn truncate_output(text: &str, limit: usize) -> String {
    if limit == 0 || text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... [output truncated, {} of {} bytes shown]",
        &text[..end],
        end,
        text.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mcp::ToolContent;

    fn text_of(result: &ToolCallResult) -> &str {
        match &result.content[0] {
            ToolContent::Text { text } => text,
        }
    }

    #[test]
    fn test_string_result_passes_through() {
        let result = tool_result(Ok(json!("plain")), 100);
        assert!(!result.is_error);
        assert_eq!(text_of(&result), "plain");
    }

    #[test]
    fn test_object_result_is_pretty_json() {
        let result = tool_result(Ok(json!({"a": 1})), 100);
        let parsed: Value = serde_json::from_str(text_of(&result)).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn test_error_result() {
        let result = tool_result(Err(ServiceError::Forbidden("read-only".into())), 100);
        assert!(result.is_error);
        assert!(text_of(&result).contains("read-only"));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short", 10), "short");
        let cut = truncate_output("abcdefghij", 4);
        assert!(cut.starts_with("abcd\n"));
        assert!(cut.contains("4 of 10 bytes"));
        // multi-byte char straddling the limit
        let cut = truncate_output("aé", 2);
        assert!(cut.starts_with("a\n"));
    }

    #[test]
    fn test_error_payload() {
        let body = error_payload(&ServiceError::NotFound("sam".into()));
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("sam"));
    }
}
