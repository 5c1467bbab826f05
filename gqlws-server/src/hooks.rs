use async_trait::async_trait;
use gqlws_core::{ExecutionError, ExecutionParams, Message, OperationId};
use serde_json::{Map, Value};

/// Per-connection extension points.
///
/// Every method has a default, so implementors only override what they need.
#[async_trait]
pub trait ServerHooks: Send + Sync {
    /// Called for `connection_init`. The returned map seeds the context of
    /// every operation on the connection; an `Err` rejects the connection
    /// with a `connection_error` carrying that message.
    async fn on_connect(&self, payload: Option<&Value>) -> Result<Map<String, Value>, String> {
        Ok(payload
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }

    /// Called before an operation runs; may rewrite its parameters or refuse it.
    async fn on_operation(
        &self,
        message: &Message,
        params: ExecutionParams,
    ) -> Result<ExecutionParams, ExecutionError> {
        let _ = message;
        Ok(params)
    }

    fn on_operation_complete(&self, id: &OperationId) {
        let _ = id;
    }

    fn on_disconnect(&self) {}
}

/// Hooks that accept everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}
