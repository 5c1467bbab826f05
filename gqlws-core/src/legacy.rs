//! Bridges the deprecated message vocabulary onto the current one.
//!
//! Both generations share one [`MessageType`] enum; [`TRANSLATIONS`] is the
//! single table pairing every legacy kind with its current equivalent. The
//! rewrite functions never touch their input: they build a new message, or
//! return `None` when the message must not be forwarded at all.

use crate::message::{Message, MessageType};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

/// `(legacy, current)` pairs.
pub const TRANSLATIONS: [(MessageType, MessageType); 7] = [
    (MessageType::Init, MessageType::ConnectionInit),
    (MessageType::InitSuccess, MessageType::ConnectionAck),
    (MessageType::InitFail, MessageType::ConnectionError),
    (MessageType::SubscriptionStart, MessageType::Start),
    (MessageType::SubscriptionEnd, MessageType::Stop),
    (MessageType::SubscriptionData, MessageType::Data),
    (MessageType::SubscriptionFail, MessageType::Error),
];

pub fn current_equivalent(legacy: MessageType) -> Option<MessageType> {
    TRANSLATIONS
        .iter()
        .find(|(old, _)| *old == legacy)
        .map(|(_, new)| *new)
}

pub fn legacy_equivalent(current: MessageType) -> Option<MessageType> {
    TRANSLATIONS
        .iter()
        .find(|(_, new)| *new == current)
        .map(|(old, _)| *old)
}

/// Rewrites a legacy message into the current vocabulary. Current messages
/// come back unchanged.
pub fn to_current(msg: &Message) -> Message {
    match msg {
        Message::Init { payload } => Message::ConnectionInit {
            payload: payload.clone(),
        },
        Message::InitSuccess => Message::ConnectionAck,
        Message::InitFail { payload } => Message::ConnectionError {
            payload: expand_init_fail(payload),
        },
        Message::SubscriptionStart { id, payload } => Message::Start {
            id: id.clone(),
            payload: payload.clone(),
        },
        Message::SubscriptionEnd { id } => Message::Stop { id: id.clone() },
        Message::SubscriptionData { id, payload } => Message::Data {
            id: id.clone(),
            payload: payload.clone(),
        },
        Message::SubscriptionFail { id, payload } => Message::Error {
            id: id.clone(),
            payload: payload.clone(),
        },
        other => other.clone(),
    }
}

/// Rewrites a current message into the legacy vocabulary.
///
/// `complete` has no legacy counterpart and yields `None`.
pub fn to_legacy(msg: &Message) -> Option<Message> {
    let rewritten = match msg {
        Message::ConnectionInit { payload } => Message::Init {
            payload: payload.clone(),
        },
        Message::ConnectionAck => Message::InitSuccess,
        Message::ConnectionError { payload } => Message::InitFail {
            payload: collapse_connection_error(payload),
        },
        Message::Start { id, payload } => Message::SubscriptionStart {
            id: id.clone(),
            payload: payload.clone(),
        },
        Message::Stop { id } => Message::SubscriptionEnd { id: id.clone() },
        Message::Data { id, payload } => Message::SubscriptionData {
            id: id.clone(),
            payload: payload.clone(),
        },
        Message::Error { id, payload } => Message::SubscriptionFail {
            id: id.clone(),
            payload: payload.clone(),
        },
        Message::Complete { .. } => return None,
        other => other.clone(),
    };
    Some(rewritten)
}

// `{message: "..."}` becomes `{error: "..."}`; anything richer is kept as is.
fn collapse_connection_error(payload: &JsonValue) -> JsonValue {
    match payload.as_object() {
        Some(map) if map.len() == 1 => match map.get("message") {
            Some(JsonValue::String(message)) => json!({ "error": message }),
            _ => payload.clone(),
        },
        _ => payload.clone(),
    }
}

fn expand_init_fail(payload: &JsonValue) -> JsonValue {
    match payload.as_object() {
        Some(map) if map.len() == 1 => match map.get("error") {
            Some(JsonValue::String(message)) => json!({ "message": message }),
            _ => payload.clone(),
        },
        _ => payload.clone(),
    }
}

/// Per-connection adapter on the accepting side.
///
/// The legacy flag latches on the first legacy `init` and never reverts.
#[derive(Debug, Clone, Default)]
pub struct LegacyAdapter {
    legacy: bool,
}

impl LegacyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Normalizes a client-origin message into the current vocabulary.
    pub fn rewrite_inbound(&mut self, msg: &Message) -> Message {
        if matches!(msg, Message::Init { .. }) && !self.legacy {
            debug!("Legacy init observed, switching connection to legacy vocabulary");
            self.legacy = true;
        }
        to_current(msg)
    }

    /// Prepares a server-origin message for this connection's client.
    pub fn rewrite_outbound(&self, msg: &Message) -> Option<Message> {
        if self.legacy {
            to_legacy(msg)
        } else if msg.message_type() == MessageType::SubscriptionSuccess {
            None
        } else {
            Some(msg.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OperationId;
    use crate::message::{ExecutionResult, OperationPayload};
    use proptest::prelude::*;

    #[test]
    fn test_translation_table_is_a_bijection() {
        for (old, new) in TRANSLATIONS {
            assert!(old.is_legacy());
            assert!(!new.is_legacy());
            assert_eq!(current_equivalent(old), Some(new));
            assert_eq!(legacy_equivalent(new), Some(old));
        }
        assert_eq!(legacy_equivalent(MessageType::Complete), None);
        assert_eq!(current_equivalent(MessageType::Start), None);
    }

    #[test]
    fn test_inbound_init_then_subscription_start() {
        let mut adapter = LegacyAdapter::new();
        assert!(!adapter.is_legacy());

        let init = Message::from_json(&json!({"type": "init", "payload": {"token": "t"}})).unwrap();
        let start = Message::from_json(&json!({
            "type": "subscription_start",
            "id": 1,
            "query": "subscription { tick }",
            "operationName": "Tick",
            "variables": {"every": 5}
        }))
        .unwrap();

        let first = adapter.rewrite_inbound(&init);
        assert!(adapter.is_legacy());
        assert_eq!(
            first,
            Message::ConnectionInit {
                payload: Some(json!({"token": "t"}))
            }
        );

        let second = adapter.rewrite_inbound(&start);
        assert_eq!(
            second.to_json(),
            json!({
                "type": "start",
                "id": 1,
                "payload": {
                    "query": "subscription { tick }",
                    "operationName": "Tick",
                    "variables": {"every": 5}
                }
            })
        );
    }

    #[test]
    fn test_inbound_subscription_end_becomes_stop() {
        let mut adapter = LegacyAdapter::new();
        let end = Message::SubscriptionEnd {
            id: OperationId::Number(4),
        };
        assert_eq!(
            adapter.rewrite_inbound(&end),
            Message::Stop {
                id: OperationId::Number(4)
            }
        );
    }

    #[test]
    fn test_flag_latches() {
        let mut adapter = LegacyAdapter::new();
        adapter.rewrite_inbound(&Message::Init { payload: None });
        adapter.rewrite_inbound(&Message::ConnectionInit { payload: None });
        adapter.rewrite_inbound(&Message::ConnectionTerminate);
        assert!(adapter.is_legacy());
    }

    #[test]
    fn test_outbound_on_legacy_connection() {
        let mut adapter = LegacyAdapter::new();
        adapter.rewrite_inbound(&Message::Init { payload: None });
        let id = OperationId::Number(2);

        assert_eq!(
            adapter.rewrite_outbound(&Message::ConnectionAck),
            Some(Message::InitSuccess)
        );
        assert_eq!(
            adapter.rewrite_outbound(&Message::connection_error("bad token")),
            Some(Message::InitFail {
                payload: json!({"error": "bad token"})
            })
        );
        assert_eq!(
            adapter.rewrite_outbound(&Message::Complete { id: id.clone() }),
            None
        );
        assert_eq!(
            adapter
                .rewrite_outbound(&Message::Data {
                    id: id.clone(),
                    payload: ExecutionResult::data(json!({"a": 1})),
                })
                .map(|m| m.message_type()),
            Some(MessageType::SubscriptionData)
        );
        assert_eq!(
            adapter
                .rewrite_outbound(&Message::Error {
                    id: id.clone(),
                    payload: json!([{"message": "x"}]),
                })
                .map(|m| m.message_type()),
            Some(MessageType::SubscriptionFail)
        );
        assert_eq!(
            adapter.rewrite_outbound(&Message::SubscriptionSuccess { id: id.clone() }),
            Some(Message::SubscriptionSuccess { id })
        );
        assert_eq!(
            adapter.rewrite_outbound(&Message::ConnectionKeepAlive),
            Some(Message::ConnectionKeepAlive)
        );
    }

    #[test]
    fn test_structured_connection_error_is_not_collapsed() {
        let payload = json!({"message": "denied", "code": 4401});
        assert_eq!(collapse_connection_error(&payload), payload);
    }

    #[test]
    fn test_outbound_on_current_connection() {
        let adapter = LegacyAdapter::new();
        let id = OperationId::from("5");

        assert_eq!(
            adapter.rewrite_outbound(&Message::SubscriptionSuccess { id: id.clone() }),
            None
        );
        let complete = Message::Complete { id };
        assert_eq!(adapter.rewrite_outbound(&complete), Some(complete));
        assert_eq!(
            adapter.rewrite_outbound(&Message::ConnectionAck),
            Some(Message::ConnectionAck)
        );
    }

    #[test]
    fn test_client_side_round_trip() {
        let start = Message::Start {
            id: OperationId::from("0"),
            payload: OperationPayload::new("subscription { a }"),
        };
        let legacy = to_legacy(&start).unwrap();
        assert_eq!(legacy.message_type(), MessageType::SubscriptionStart);
        assert_eq!(to_current(&legacy), start);

        let fail = Message::InitFail {
            payload: json!({"error": "nope"}),
        };
        assert_eq!(to_current(&fail), Message::connection_error("nope"));
    }

    proptest! {
        #[test]
        fn current_operation_messages_pass_back_unchanged(n in any::<u64>(), kind in 0usize..3) {
            let id = OperationId::Number(n);
            let msg = match kind {
                0 => Message::Stop { id },
                1 => Message::Data { id, payload: ExecutionResult::data(json!(n)) },
                _ => Message::Error { id, payload: json!([{"message": n.to_string()}]) },
            };
            let legacy = to_legacy(&msg).unwrap();
            prop_assert!(legacy.message_type().is_legacy());
            prop_assert_eq!(to_current(&legacy), msg);
        }
    }
}
