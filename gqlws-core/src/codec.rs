use crate::message::{Message, MessageError};
use serde_json::Value;

/// Serializes a message into one text frame.
pub fn encode_message(msg: &Message) -> String {
    msg.to_json().to_string()
}

/// Parses one text frame.
///
/// Text that is not JSON fails with [`MessageError::Decode`]; such a failure
/// never carries an operation id.
pub fn decode_message(text: &str) -> Result<Message, MessageError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| MessageError::Decode(e.to_string()))?;
    Message::from_json(&value)
}
