use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Machine-readable error classes, reported under `extensions.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    ProtocolViolation,
    Unauthenticated,
    Timeout,
    Canceled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// A single GraphQL-style error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            extensions: None,
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            extensions: Some(json!({ "code": code })),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(|code| serde_json::from_value(code.clone()).ok())
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Reads the error list out of an `error`/`connection_error` payload.
///
/// Peers send an array of errors, an object wrapping `errors`, a single
/// `{message}` object, or a legacy `{error}` object; all of them collapse
/// into a list here.
pub fn errors_from_payload(payload: &Value) -> Vec<GraphQLError> {
    match payload {
        Value::Array(items) => items.iter().map(error_from_value).collect(),
        Value::Object(map) => match map.get("errors") {
            Some(Value::Array(items)) => items.iter().map(error_from_value).collect(),
            _ => vec![error_from_value(payload)],
        },
        Value::Null => Vec::new(),
        other => vec![error_from_value(other)],
    }
}

fn error_from_value(value: &Value) -> GraphQLError {
    if let Ok(error) = serde_json::from_value::<GraphQLError>(value.clone()) {
        return error;
    }
    match value {
        Value::String(s) => GraphQLError::new(s.clone()),
        Value::Object(map) => match map.get("error").and_then(Value::as_str) {
            Some(message) => GraphQLError::new(message),
            None => GraphQLError::new(value.to_string()),
        },
        other => GraphQLError::new(other.to_string()),
    }
}

/// Failure produced by the executor or surfaced by a result sequence.
///
/// Cloneable so a failed sequence can report the same error on every pull.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    pub errors: Vec<GraphQLError>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecutionError {
            errors: vec![GraphQLError::new(message)],
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        ExecutionError {
            errors: vec![GraphQLError::with_code(code, message)],
        }
    }

    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        ExecutionError { errors }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Internal, message)
    }

    pub fn message(&self) -> &str {
        self.errors
            .first()
            .map(|e| e.message.as_str())
            .unwrap_or("unknown error")
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(&self.errors).unwrap_or(Value::Array(Vec::new()))
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_with_code() {
        let err = GraphQLError::with_code(ErrorCode::Timeout, "too slow");
        assert_eq!(err.message, "too slow");
        assert_eq!(err.code(), Some(ErrorCode::Timeout));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, json!({"message": "too slow", "extensions": {"code": "TIMEOUT"}}));
    }

    #[test]
    fn test_plain_error_omits_extensions() {
        let json = serde_json::to_string(&GraphQLError::new("boom")).unwrap();
        assert_eq!(json, r#"{"message":"boom"}"#);
    }

    #[test]
    fn test_errors_from_payload_shapes() {
        let array = errors_from_payload(&json!([{"message": "a"}, {"message": "b"}]));
        assert_eq!(array.len(), 2);
        assert_eq!(array[1].message, "b");

        let wrapped = errors_from_payload(&json!({"errors": [{"message": "c"}]}));
        assert_eq!(wrapped, vec![GraphQLError::new("c")]);

        let single = errors_from_payload(&json!({"message": "d"}));
        assert_eq!(single, vec![GraphQLError::new("d")]);

        let legacy = errors_from_payload(&json!({"error": "e"}));
        assert_eq!(legacy, vec![GraphQLError::new("e")]);

        let text = errors_from_payload(&json!("f"));
        assert_eq!(text, vec![GraphQLError::new("f")]);

        assert!(errors_from_payload(&Value::Null).is_empty());
    }

    #[test]
    fn test_execution_error_display_joins_messages() {
        let err = ExecutionError::from_errors(vec![GraphQLError::new("x"), GraphQLError::new("y")]);
        assert_eq!(err.to_string(), "x; y");
        assert_eq!(err.message(), "x");
        assert_eq!(err.to_payload(), json!([{"message": "x"}, {"message": "y"}]));
    }
}
