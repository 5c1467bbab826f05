use crate::ids::OperationId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::fmt;

/// Every message kind either protocol generation can put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectionInit,
    ConnectionAck,
    ConnectionError,
    ConnectionKeepAlive,
    ConnectionTerminate,
    Start,
    Data,
    Error,
    Complete,
    Stop,
    SubscriptionSuccess,
    // Legacy vocabulary
    Init,
    InitSuccess,
    InitFail,
    SubscriptionStart,
    SubscriptionEnd,
    SubscriptionData,
    SubscriptionFail,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionInit => "connection_init",
            MessageType::ConnectionAck => "connection_ack",
            MessageType::ConnectionError => "connection_error",
            MessageType::ConnectionKeepAlive => "connection_keep_alive",
            MessageType::ConnectionTerminate => "connection_terminate",
            MessageType::Start => "start",
            MessageType::Data => "data",
            MessageType::Error => "error",
            MessageType::Complete => "complete",
            MessageType::Stop => "stop",
            MessageType::SubscriptionSuccess => "subscription_success",
            MessageType::Init => "init",
            MessageType::InitSuccess => "init_success",
            MessageType::InitFail => "init_fail",
            MessageType::SubscriptionStart => "subscription_start",
            MessageType::SubscriptionEnd => "subscription_end",
            MessageType::SubscriptionData => "subscription_data",
            MessageType::SubscriptionFail => "subscription_fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "connection_init" => MessageType::ConnectionInit,
            "connection_ack" => MessageType::ConnectionAck,
            "connection_error" => MessageType::ConnectionError,
            "connection_keep_alive" | "ka" => MessageType::ConnectionKeepAlive,
            "connection_terminate" => MessageType::ConnectionTerminate,
            "start" => MessageType::Start,
            "data" => MessageType::Data,
            "error" => MessageType::Error,
            "complete" => MessageType::Complete,
            "stop" => MessageType::Stop,
            "subscription_success" => MessageType::SubscriptionSuccess,
            "init" => MessageType::Init,
            "init_success" => MessageType::InitSuccess,
            "init_fail" => MessageType::InitFail,
            "subscription_start" => MessageType::SubscriptionStart,
            "subscription_end" => MessageType::SubscriptionEnd,
            "subscription_data" => MessageType::SubscriptionData,
            "subscription_fail" => MessageType::SubscriptionFail,
            _ => return None,
        };
        Some(kind)
    }

    /// True for kinds that only exist in the deprecated vocabulary.
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            MessageType::Init
                | MessageType::InitSuccess
                | MessageType::InitFail
                | MessageType::SubscriptionStart
                | MessageType::SubscriptionEnd
                | MessageType::SubscriptionData
                | MessageType::SubscriptionFail
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation a client asks the server to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, JsonValue>>,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

impl OperationPayload {
    pub fn new(query: impl Into<String>) -> Self {
        OperationPayload {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    /// Reads query/variables/operationName out of an object, which is either a
    /// `start` payload or a legacy `subscription_start` message itself.
    fn from_fields(
        fields: &Map<String, JsonValue>,
        kind: MessageType,
        prefix: &'static str,
        id: Option<&OperationId>,
    ) -> Result<Self, MessageError> {
        let field_name = |name: &'static str| -> &'static str {
            match (prefix, name) {
                ("payload", "query") => "payload.query",
                ("payload", "variables") => "payload.variables",
                ("payload", "operationName") => "payload.operationName",
                (_, name) => name,
            }
        };

        let query = match fields.get("query") {
            Some(JsonValue::String(q)) => q.clone(),
            Some(_) => return Err(MessageError::invalid(kind, field_name("query"), id)),
            None => return Err(MessageError::missing(kind, field_name("query"), id)),
        };

        let variables = match fields.get("variables") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::Object(vars)) => Some(vars.clone()),
            Some(_) => return Err(MessageError::invalid(kind, field_name("variables"), id)),
        };

        let operation_name = match fields.get("operationName") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(name)) => Some(name.clone()),
            Some(_) => {
                return Err(MessageError::invalid(
                    kind,
                    field_name("operationName"),
                    id,
                ))
            }
        };

        Ok(OperationPayload {
            query,
            variables,
            operation_name,
        })
    }

    fn write_fields(&self, target: &mut Map<String, JsonValue>) {
        target.insert("query".to_string(), JsonValue::String(self.query.clone()));
        if let Some(variables) = &self.variables {
            target.insert(
                "variables".to_string(),
                JsonValue::Object(variables.clone()),
            );
        }
        if let Some(name) = &self.operation_name {
            target.insert(
                "operationName".to_string(),
                JsonValue::String(name.clone()),
            );
        }
    }
}

/// One result delivered for an operation: data, errors, or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<JsonValue>>,
}

impl ExecutionResult {
    pub fn data(data: JsonValue) -> Self {
        ExecutionResult {
            data: Some(data),
            errors: None,
        }
    }

    pub fn errors(errors: Vec<JsonValue>) -> Self {
        ExecutionResult {
            data: None,
            errors: Some(errors),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// A protocol message of either generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConnectionInit { payload: Option<JsonValue> },
    ConnectionAck,
    ConnectionError { payload: JsonValue },
    ConnectionKeepAlive,
    ConnectionTerminate,
    Start { id: OperationId, payload: OperationPayload },
    Data { id: OperationId, payload: ExecutionResult },
    Error { id: OperationId, payload: JsonValue },
    Complete { id: OperationId },
    Stop { id: OperationId },
    SubscriptionSuccess { id: OperationId },

    /// Legacy `init`
    Init { payload: Option<JsonValue> },
    /// Legacy `init_success`
    InitSuccess,
    /// Legacy `init_fail`
    InitFail { payload: JsonValue },
    /// Legacy `subscription_start`; the operation fields sit at the top level on the wire.
    SubscriptionStart { id: OperationId, payload: OperationPayload },
    /// Legacy `subscription_end`
    SubscriptionEnd { id: OperationId },
    /// Legacy `subscription_data`
    SubscriptionData { id: OperationId, payload: ExecutionResult },
    /// Legacy `subscription_fail`
    SubscriptionFail { id: OperationId, payload: JsonValue },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectionInit { .. } => MessageType::ConnectionInit,
            Message::ConnectionAck => MessageType::ConnectionAck,
            Message::ConnectionError { .. } => MessageType::ConnectionError,
            Message::ConnectionKeepAlive => MessageType::ConnectionKeepAlive,
            Message::ConnectionTerminate => MessageType::ConnectionTerminate,
            Message::Start { .. } => MessageType::Start,
            Message::Data { .. } => MessageType::Data,
            Message::Error { .. } => MessageType::Error,
            Message::Complete { .. } => MessageType::Complete,
            Message::Stop { .. } => MessageType::Stop,
            Message::SubscriptionSuccess { .. } => MessageType::SubscriptionSuccess,
            Message::Init { .. } => MessageType::Init,
            Message::InitSuccess => MessageType::InitSuccess,
            Message::InitFail { .. } => MessageType::InitFail,
            Message::SubscriptionStart { .. } => MessageType::SubscriptionStart,
            Message::SubscriptionEnd { .. } => MessageType::SubscriptionEnd,
            Message::SubscriptionData { .. } => MessageType::SubscriptionData,
            Message::SubscriptionFail { .. } => MessageType::SubscriptionFail,
        }
    }

    /// The operation this message belongs to, if it is operation-scoped.
    pub fn id(&self) -> Option<&OperationId> {
        match self {
            Message::Start { id, .. }
            | Message::Data { id, .. }
            | Message::Error { id, .. }
            | Message::Complete { id }
            | Message::Stop { id }
            | Message::SubscriptionSuccess { id }
            | Message::SubscriptionStart { id, .. }
            | Message::SubscriptionEnd { id }
            | Message::SubscriptionData { id, .. }
            | Message::SubscriptionFail { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Message::ConnectionError {
            payload: json!({ "message": message.into() }),
        }
    }

    /// Parse a message from a JSON value
    pub fn from_json(value: &JsonValue) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;

        let type_name = match obj.get("type") {
            Some(JsonValue::String(t)) => t.as_str(),
            Some(_) | None => return Err(MessageError::MissingType),
        };
        let kind = MessageType::parse(type_name)
            .ok_or_else(|| MessageError::UnknownType(type_name.to_string()))?;

        // Never inferred: a malformed id is reported the same way as an absent one.
        let id = obj.get("id").and_then(OperationId::from_json);
        let require_id = || {
            id.clone()
                .ok_or_else(|| MessageError::missing(kind, "id", None))
        };

        let message = match kind {
            MessageType::ConnectionInit => Message::ConnectionInit {
                payload: optional_payload(obj),
            },
            MessageType::ConnectionAck => Message::ConnectionAck,
            MessageType::ConnectionError => Message::ConnectionError {
                payload: required_payload(obj, kind, None)?,
            },
            MessageType::ConnectionKeepAlive => Message::ConnectionKeepAlive,
            MessageType::ConnectionTerminate => Message::ConnectionTerminate,
            MessageType::Start => {
                let id = require_id()?;
                let payload = match obj.get("payload") {
                    Some(JsonValue::Object(fields)) => {
                        OperationPayload::from_fields(fields, kind, "payload", Some(&id))?
                    }
                    Some(_) => return Err(MessageError::invalid(kind, "payload", Some(&id))),
                    None => return Err(MessageError::missing(kind, "payload", Some(&id))),
                };
                Message::Start { id, payload }
            }
            MessageType::Data => {
                let id = require_id()?;
                let payload = result_payload(obj, kind, &id)?;
                Message::Data { id, payload }
            }
            MessageType::Error => {
                let id = require_id()?;
                let payload = required_payload(obj, kind, Some(&id))?;
                Message::Error { id, payload }
            }
            MessageType::Complete => Message::Complete { id: require_id()? },
            MessageType::Stop => Message::Stop { id: require_id()? },
            MessageType::SubscriptionSuccess => Message::SubscriptionSuccess { id: require_id()? },
            MessageType::Init => Message::Init {
                payload: optional_payload(obj),
            },
            MessageType::InitSuccess => Message::InitSuccess,
            MessageType::InitFail => Message::InitFail {
                payload: optional_payload(obj).unwrap_or(JsonValue::Null),
            },
            MessageType::SubscriptionStart => {
                let id = require_id()?;
                let payload = OperationPayload::from_fields(obj, kind, "", Some(&id))?;
                Message::SubscriptionStart { id, payload }
            }
            MessageType::SubscriptionEnd => Message::SubscriptionEnd { id: require_id()? },
            MessageType::SubscriptionData => {
                let id = require_id()?;
                let payload = result_payload(obj, kind, &id)?;
                Message::SubscriptionData { id, payload }
            }
            MessageType::SubscriptionFail => {
                let id = require_id()?;
                let payload = required_payload(obj, kind, Some(&id))?;
                Message::SubscriptionFail { id, payload }
            }
        };

        Ok(message)
    }

    /// Convert the message to a JSON value
    pub fn to_json(&self) -> JsonValue {
        let mut obj = Map::new();
        obj.insert(
            "type".to_string(),
            JsonValue::String(self.message_type().as_str().to_string()),
        );
        if let Some(id) = self.id() {
            obj.insert("id".to_string(), id.to_json());
        }

        match self {
            Message::ConnectionInit { payload } | Message::Init { payload } => {
                if let Some(payload) = payload {
                    obj.insert("payload".to_string(), payload.clone());
                }
            }
            Message::ConnectionError { payload }
            | Message::Error { payload, .. }
            | Message::InitFail { payload }
            | Message::SubscriptionFail { payload, .. } => {
                obj.insert("payload".to_string(), payload.clone());
            }
            Message::Start { payload, .. } => {
                let mut fields = Map::new();
                payload.write_fields(&mut fields);
                obj.insert("payload".to_string(), JsonValue::Object(fields));
            }
            Message::SubscriptionStart { payload, .. } => {
                payload.write_fields(&mut obj);
            }
            Message::Data { payload, .. } | Message::SubscriptionData { payload, .. } => {
                obj.insert(
                    "payload".to_string(),
                    serde_json::to_value(payload).unwrap_or(JsonValue::Null),
                );
            }
            Message::ConnectionAck
            | Message::ConnectionKeepAlive
            | Message::ConnectionTerminate
            | Message::InitSuccess
            | Message::Complete { .. }
            | Message::Stop { .. }
            | Message::SubscriptionSuccess { .. }
            | Message::SubscriptionEnd { .. } => {}
        }

        JsonValue::Object(obj)
    }
}

fn optional_payload(obj: &Map<String, JsonValue>) -> Option<JsonValue> {
    match obj.get("payload") {
        None | Some(JsonValue::Null) => None,
        Some(payload) => Some(payload.clone()),
    }
}

fn required_payload(
    obj: &Map<String, JsonValue>,
    kind: MessageType,
    id: Option<&OperationId>,
) -> Result<JsonValue, MessageError> {
    optional_payload(obj).ok_or_else(|| MessageError::missing(kind, "payload", id))
}

fn result_payload(
    obj: &Map<String, JsonValue>,
    kind: MessageType,
    id: &OperationId,
) -> Result<ExecutionResult, MessageError> {
    match obj.get("payload") {
        Some(payload @ JsonValue::Object(_)) => serde_json::from_value(payload.clone())
            .map_err(|_| MessageError::invalid(kind, "payload", Some(id))),
        Some(JsonValue::Null) | None => Err(MessageError::missing(kind, "payload", Some(id))),
        Some(_) => Err(MessageError::invalid(kind, "payload", Some(id))),
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Message::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Why an inbound frame could not become a [`Message`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    /// The frame is not well-formed JSON text.
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message has no type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Message '{kind}' is missing required field '{field}'")]
    MissingField {
        kind: MessageType,
        field: &'static str,
        id: Option<OperationId>,
    },

    #[error("Message '{kind}' has an invalid '{field}' field")]
    InvalidField {
        kind: MessageType,
        field: &'static str,
        id: Option<OperationId>,
    },
}

impl MessageError {
    fn missing(kind: MessageType, field: &'static str, id: Option<&OperationId>) -> Self {
        MessageError::MissingField {
            kind,
            field,
            id: id.cloned(),
        }
    }

    fn invalid(kind: MessageType, field: &'static str, id: Option<&OperationId>) -> Self {
        MessageError::InvalidField {
            kind,
            field,
            id: id.cloned(),
        }
    }

    /// Frames that never made it to a JSON object.
    pub fn is_decode(&self) -> bool {
        matches!(self, MessageError::Decode(_) | MessageError::NotAnObject)
    }

    /// Well-formed messages whose kind is absent or unrecognized.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, MessageError::MissingType | MessageError::UnknownType(_))
    }

    /// Known kinds with a missing or mistyped field.
    pub fn is_malformed_operation(&self) -> bool {
        matches!(
            self,
            MessageError::MissingField { .. } | MessageError::InvalidField { .. }
        )
    }

    /// The operation the broken message addressed, when it carried a usable id.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            MessageError::MissingField { id, .. } | MessageError::InvalidField { id, .. } => {
                id.as_ref()
            }
            _ => None,
        }
    }
}
