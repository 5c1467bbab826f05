//! Client side of one connection.
//!
//! The [`Multiplexer`] allocates operation ids, keeps one record per live
//! operation and routes every inbound message to the callback registered for
//! its id. It never touches the socket: outbound frames go into a channel
//! (or the pending queue while the connection is still coming up) and the
//! connection driver feeds inbound frames back through
//! [`Multiplexer::handle_frame`].
//!
//! Callbacks always run after the registry lock has been released, so a
//! callback may call back into the multiplexer.

use crate::error::{ClientError, OperationError};
use gqlws_core::legacy::{to_current, to_legacy};
use gqlws_core::{
    decode_message, encode_message, errors_from_payload, GraphQLError, Message, OperationId,
    OperationIdAllocator, OperationPayload,
};
use gqlws_transport::Protocol;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Receives `(error, result)` for one operation.
///
/// `(None, None)` means the server acknowledged a subscription.
pub type OperationCallback = Arc<dyn Fn(Option<OperationError>, Option<Value>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl SubscribeOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Builds options from loosely typed input, checking that `query` is
    /// text, `variables` an object and `operationName` text.
    pub fn from_value(value: &Value) -> Result<Self, ClientError> {
        let options: SubscribeOptions = serde_json::from_value(value.clone())
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.query.trim().is_empty() {
            return Err(ClientError::Validation(
                "query must be a non-empty string".to_string(),
            ));
        }
        Ok(())
    }

    fn into_payload(self) -> OperationPayload {
        OperationPayload {
            query: self.query,
            variables: self.variables,
            operation_name: self.operation_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct MultiplexerOptions {
    /// Deadline for the first message of each operation.
    pub timeout: Option<Duration>,
    pub protocol: Protocol,
}

struct OperationRecord {
    callback: OperationCallback,
    timer: Option<AbortHandle>,
    acknowledged: bool,
}

impl OperationRecord {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct State {
    operations: IndexMap<OperationId, OperationRecord>,
    pending: VecDeque<String>,
    connection: ConnectionState,
    acknowledged: bool,
    /// Why the server refused `connection_init`, if it did.
    rejection: Option<Vec<GraphQLError>>,
}

struct Inner {
    state: Mutex<State>,
    ids: OperationIdAllocator,
    outgoing: mpsc::UnboundedSender<String>,
    options: MultiplexerOptions,
}

/// Callback invocations collected under the lock and run after it.
type Deliveries = Vec<(OperationCallback, Option<OperationError>, Option<Value>)>;

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Multiplexer")
            .field("connection", &state.connection)
            .field("operations", &state.operations.len())
            .field("pending", &state.pending.len())
            .field("protocol", &self.inner.options.protocol)
            .finish()
    }
}

impl Multiplexer {
    /// Creates a multiplexer in the `Connecting` state. Frames to put on the
    /// wire come out of the returned receiver.
    pub fn new(options: MultiplexerOptions) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            state: Mutex::new(State {
                operations: IndexMap::new(),
                pending: VecDeque::new(),
                connection: ConnectionState::Connecting,
                acknowledged: false,
                rejection: None,
            }),
            ids: OperationIdAllocator::new(),
            outgoing,
            options,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    /// Errors from a `connection_error` (or legacy `init_fail`) that
    /// answered `connection_init`.
    pub fn rejection(&self) -> Option<Vec<GraphQLError>> {
        self.lock().rejection.clone()
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.options.protocol
    }

    pub fn is_registered(&self, id: &OperationId) -> bool {
        self.lock().operations.contains_key(id)
    }

    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Frames waiting for the connection to open.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Encodes a client message in this connection's vocabulary.
    pub fn encode(&self, message: &Message) -> String {
        if self.inner.options.protocol.is_legacy() {
            if let Some(legacy) = to_legacy(message) {
                return encode_message(&legacy);
            }
        }
        encode_message(message)
    }

    /// Starts an operation. The callback is invoked for every message the
    /// server sends for it until the operation ends.
    pub fn subscribe<F>(&self, options: SubscribeOptions, callback: F) -> Result<OperationId, ClientError>
    where
        F: Fn(Option<OperationError>, Option<Value>) + Send + Sync + 'static,
    {
        options.validate()?;

        let mut state = self.lock();
        if matches!(
            state.connection,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(ClientError::Closed);
        }

        let id = self.inner.ids.allocate();
        let timer = self
            .inner
            .options
            .timeout
            .and_then(|timeout| self.arm_timer(id.clone(), timeout));
        state.operations.insert(
            id.clone(),
            OperationRecord {
                callback: Arc::new(callback),
                timer,
                acknowledged: false,
            },
        );

        let frame = self.encode(&Message::Start {
            id: id.clone(),
            payload: options.into_payload(),
        });
        debug!(%id, state = ?state.connection, "Operation registered");
        self.emit(&mut state, frame);
        Ok(id)
    }

    /// Releases an operation and tells the server to stop it.
    ///
    /// The `stop` is sent right away when open, queued behind earlier frames
    /// while connecting, and dropped once the connection is going away.
    pub fn unsubscribe(&self, id: &OperationId) {
        let mut state = self.lock();
        if let Some(mut record) = state.operations.shift_remove(id) {
            record.disarm();
            debug!(%id, "Operation released");
        }
        let frame = self.encode(&Message::Stop { id: id.clone() });
        self.emit(&mut state, frame);
    }

    /// Unsubscribes every registered operation, oldest first.
    pub fn unsubscribe_all(&self) {
        let ids: Vec<OperationId> = self.lock().operations.keys().cloned().collect();
        for id in &ids {
            self.unsubscribe(id);
        }
    }

    /// Moves to `Open` and flushes the pending queue, in order.
    pub fn mark_open(&self) {
        let mut state = self.lock();
        if state.connection != ConnectionState::Connecting {
            return;
        }
        state.connection = ConnectionState::Open;
        let pending: Vec<String> = state.pending.drain(..).collect();
        debug!(flushed = pending.len(), "Connection open");
        for frame in pending {
            if self.inner.outgoing.send(frame).is_err() {
                warn!("Outgoing channel closed while flushing");
                break;
            }
        }
    }

    /// Moves to `Closing` and queues `connection_terminate` as the last frame.
    pub fn begin_close(&self) {
        let mut state = self.lock();
        match state.connection {
            ConnectionState::Open => {
                state.connection = ConnectionState::Closing;
                let frame = self.encode(&Message::ConnectionTerminate);
                let _ = self.inner.outgoing.send(frame);
            }
            ConnectionState::Connecting => {
                state.connection = ConnectionState::Closing;
                state.pending.clear();
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// The connection is gone: every remaining operation fails with
    /// [`OperationError::ConnectionRejected`] if the server refused the
    /// connection, [`OperationError::ConnectionClosed`] otherwise.
    pub fn connection_lost(&self) {
        let deliveries: Deliveries = {
            let mut state = self.lock();
            state.connection = ConnectionState::Closed;
            state.pending.clear();
            let error = match &state.rejection {
                Some(errors) => OperationError::ConnectionRejected(errors.clone()),
                None => OperationError::ConnectionClosed,
            };
            state
                .operations
                .drain(..)
                .map(|(_, mut record)| {
                    record.disarm();
                    (record.callback, Some(error.clone()), None)
                })
                .collect()
        };
        if !deliveries.is_empty() {
            debug!(failed = deliveries.len(), "Connection lost with operations in flight");
        }
        deliver(deliveries);
    }

    /// Decodes one inbound frame and dispatches it. Undecodable frames are
    /// logged and dropped.
    pub fn handle_frame(&self, frame: &str) {
        match decode_message(frame) {
            Ok(message) => self.handle_message(message),
            Err(err) => warn!(error = %err, "Dropping undecodable frame from server"),
        }
    }

    pub fn handle_message(&self, message: Message) {
        let message = to_current(&message);
        trace!(kind = %message.message_type(), "Inbound message");

        let id = match &message {
            Message::ConnectionAck => {
                debug!("Connection acknowledged");
                self.lock().acknowledged = true;
                return;
            }
            Message::ConnectionKeepAlive => return,
            Message::ConnectionError { payload } => {
                let mut state = self.lock();
                if state.acknowledged {
                    warn!(%payload, "Server reported a connection error");
                } else {
                    warn!(%payload, "Server rejected the connection");
                    state.rejection = Some(errors_from_payload(payload));
                }
                return;
            }
            other => match other.id() {
                Some(id) => id.clone(),
                None => {
                    warn!(kind = %other.message_type(), "Unexpected message from server");
                    return;
                }
            },
        };

        let mut deliveries: Deliveries = Vec::new();
        let known = {
            let mut state = self.lock();
            match state.operations.get_mut(&id) {
                None => false,
                Some(record) => {
                    record.disarm();
                    match message {
                        Message::Data { payload, .. } => {
                            let callback = Arc::clone(&record.callback);
                            if payload.has_errors() {
                                let errors = payload.errors.unwrap_or_default();
                                let errors = errors_from_payload(&Value::Array(errors));
                                deliveries.push((callback, Some(OperationError::Execution(errors)), None));
                            } else {
                                let data = payload.data.unwrap_or(Value::Null);
                                deliveries.push((callback, None, Some(data)));
                            }
                        }
                        Message::SubscriptionSuccess { .. } => {
                            if !record.acknowledged {
                                record.acknowledged = true;
                                deliveries.push((Arc::clone(&record.callback), None, None));
                            }
                        }
                        Message::Error { payload, .. } => {
                            if let Some(record) = state.operations.shift_remove(&id) {
                                let errors = errors_from_payload(&payload);
                                deliveries.push((
                                    record.callback,
                                    Some(OperationError::Execution(errors)),
                                    None,
                                ));
                            }
                        }
                        Message::Complete { .. } => {
                            state.operations.shift_remove(&id);
                            debug!(%id, "Operation complete");
                        }
                        other => {
                            trace!(%id, kind = %other.message_type(), "Ignoring message");
                        }
                    }
                    true
                }
            }
        };

        if known {
            deliver(deliveries);
        } else {
            debug!(%id, "Message for unknown operation, sending stop");
            self.unsubscribe(&id);
        }
    }

    fn emit(&self, state: &mut State, frame: String) {
        match state.connection {
            ConnectionState::Open => {
                if self.inner.outgoing.send(frame).is_err() {
                    warn!("Outgoing channel closed, frame dropped");
                }
            }
            ConnectionState::Connecting => state.pending.push_back(frame),
            ConnectionState::Closing | ConnectionState::Closed => {
                trace!("Connection going away, frame dropped");
            }
        }
    }

    fn arm_timer(&self, id: OperationId, timeout: Duration) -> Option<AbortHandle> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(%id, "No async runtime, operation timeout disabled");
                return None;
            }
        };
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                Multiplexer { inner }.expire(&id, timeout);
            }
        });
        Some(task.abort_handle())
    }

    fn expire(&self, id: &OperationId, timeout: Duration) {
        let record = {
            let mut state = self.lock();
            // A message already arrived if the timer was disarmed.
            let armed = state
                .operations
                .get(id)
                .is_some_and(|record| record.timer.is_some());
            if !armed {
                return;
            }
            state.operations.shift_remove(id)
        };
        if let Some(record) = record {
            debug!(%id, ?timeout, "Operation timed out");
            (record.callback)(Some(OperationError::Timeout(timeout)), None);
        }
    }
}

fn deliver(deliveries: Deliveries) {
    for (callback, error, result) in deliveries {
        callback(error, result);
    }
}
