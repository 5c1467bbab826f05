//! Server side of one connection.
//!
//! [`ConnectionController`] owns everything per connection: the legacy
//! adapter, the operation registry and the outbound queue. Each operation
//! runs on its own task and talks back to the controller through
//! [`DriverEvent`]s, so the registry is only ever touched from the
//! controller's loop. Results for ids that are no longer registered are
//! dropped there, which is what keeps a stopped operation silent even when
//! its executor is still producing.

use crate::context::ConnectionContext;
use crate::hooks::ServerHooks;
use gqlws_core::{
    decode_message, encode_message, normalize, BoxSequence, ExecutionError, ExecutionParams,
    ExecutionResult, Executor, LegacyAdapter, Message, MessageError, OperationId,
    OperationPayload, PushSequence, Step, SubscriptionHandle,
};
use gqlws_transport::MessageTransport;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket is up, no `connection_init` accepted yet.
    Accepted,
    Active,
    Closed,
}

/// Whether the loop keeps going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Completed,
    Failed,
    Cancelled,
}

/// Reports from operation tasks to their controller.
#[derive(Debug)]
pub enum DriverEvent {
    Subscribed {
        id: OperationId,
        generation: u64,
        handle: SubscriptionHandle,
    },
    Emit {
        id: OperationId,
        generation: u64,
        message: Message,
    },
    Finished {
        id: OperationId,
        generation: u64,
        reason: FinishReason,
    },
}

/// Driver events a connection buffers before its operations wait.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval for `connection_keep_alive` after the ack; `None` disables it.
    pub keep_alive: Option<Duration>,
    /// Capacity of the channel from operation tasks to the controller. A
    /// full channel stops operations from pulling further results until
    /// the connection has written what is queued.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

pub struct ConnectionController {
    connection_id: String,
    executor: Arc<dyn Executor>,
    hooks: Arc<dyn ServerHooks>,
    config: ConnectionConfig,
    adapter: LegacyAdapter,
    context: ConnectionContext,
    state: ConnectionState,
    init_context: Map<String, Value>,
    outbox: VecDeque<String>,
    keep_alive: Option<Interval>,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: mpsc::Receiver<DriverEvent>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .field("legacy", &self.adapter.is_legacy())
            .field("operations", &self.context.len())
            .finish()
    }
}

impl ConnectionController {
    pub fn new(
        connection_id: impl Into<String>,
        executor: Arc<dyn Executor>,
        hooks: Arc<dyn ServerHooks>,
        config: ConnectionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            connection_id: connection_id.into(),
            executor,
            hooks,
            config,
            adapter: LegacyAdapter::new(),
            context: ConnectionContext::new(),
            state: ConnectionState::Accepted,
            init_context: Map::new(),
            outbox: VecDeque::new(),
            keep_alive: None,
            events_tx,
            events_rx,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_legacy(&self) -> bool {
        self.adapter.is_legacy()
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Frames produced since the last call, already encoded for this client.
    pub fn take_outbound(&mut self) -> Vec<String> {
        self.outbox.drain(..).collect()
    }

    /// Waits for the next report from an operation task.
    pub async fn next_event(&mut self) -> Option<DriverEvent> {
        self.events_rx.recv().await
    }

    /// Serves the connection until the client leaves or the transport fails.
    #[instrument(skip_all, fields(connection = %self.connection_id))]
    pub async fn run<T: MessageTransport>(mut self, mut transport: T) {
        info!("Connection accepted");

        loop {
            let flow = tokio::select! {
                frame = transport.recv() => match frame {
                    Ok(Some(text)) => self.on_frame(&text).await,
                    Ok(None) => {
                        debug!("Transport closed by client");
                        Flow::Close
                    }
                    Err(e) => {
                        warn!(error = %e, "Transport receive failed");
                        Flow::Close
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    self.on_event(event);
                    Flow::Continue
                }
                _ = next_tick(&mut self.keep_alive) => {
                    trace!("Sending keep-alive");
                    self.send(Message::ConnectionKeepAlive);
                    Flow::Continue
                }
            };

            let mut failed = false;
            for frame in self.take_outbound() {
                if let Err(e) = transport.send(frame).await {
                    warn!(error = %e, "Transport send failed");
                    failed = true;
                    break;
                }
            }

            if failed || flow == Flow::Close {
                break;
            }
        }

        self.shutdown();
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
        info!("Connection closed");
    }

    /// Handles one inbound text frame.
    pub async fn on_frame(&mut self, frame: &str) -> Flow {
        if self.state == ConnectionState::Closed {
            return Flow::Close;
        }

        let message = match decode_message(frame) {
            Ok(message) => self.adapter.rewrite_inbound(&message),
            Err(err) => {
                self.on_decode_error(err);
                return Flow::Continue;
            }
        };
        trace!(kind = %message.message_type(), "Inbound message");

        match message {
            Message::ConnectionInit { payload } => self.on_connection_init(payload).await,
            Message::ConnectionTerminate => {
                debug!("Client terminated the connection");
                Flow::Close
            }
            Message::Start { id, payload } => {
                self.on_start(id, payload).await;
                Flow::Continue
            }
            Message::Stop { id } => {
                self.stop_operation(&id);
                Flow::Continue
            }
            other => {
                warn!(kind = %other.message_type(), "Unexpected message from client");
                self.send(Message::connection_error(format!(
                    "Unexpected message type: {}",
                    other.message_type()
                )));
                Flow::Continue
            }
        }
    }

    fn on_decode_error(&mut self, err: MessageError) {
        warn!(error = %err, "Rejected inbound frame");
        match err.operation_id() {
            Some(id) => {
                let id = id.clone();
                self.send(Message::Error {
                    id,
                    payload: ExecutionError::bad_request(err.to_string()).to_payload(),
                });
            }
            None => self.send(Message::connection_error(err.to_string())),
        }
    }

    async fn on_connection_init(&mut self, payload: Option<Value>) -> Flow {
        match self.hooks.on_connect(payload.as_ref()).await {
            Ok(init_context) => {
                self.init_context = init_context;
                self.state = ConnectionState::Active;
                info!(legacy = self.adapter.is_legacy(), "Connection initialized");
                self.send(Message::ConnectionAck);

                if let Some(period) = self.config.keep_alive {
                    self.send(Message::ConnectionKeepAlive);
                    let mut interval =
                        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keep_alive = Some(interval);
                }
                Flow::Continue
            }
            Err(reason) => {
                warn!(%reason, "Connection rejected");
                self.send(Message::connection_error(reason));
                Flow::Close
            }
        }
    }

    async fn on_start(&mut self, id: OperationId, payload: OperationPayload) {
        if self.context.contains(&id) {
            debug!(%id, "Operation id reused, stopping the previous run");
            self.stop_operation(&id);
        }

        let params = ExecutionParams::from_payload(&payload, self.init_context.clone());
        let message = Message::Start {
            id: id.clone(),
            payload,
        };
        let params = match self.hooks.on_operation(&message, params).await {
            Ok(params) => params,
            Err(err) => {
                debug!(%id, error = %err, "Operation refused");
                self.send(Message::Error {
                    id,
                    payload: err.to_payload(),
                });
                return;
            }
        };

        let (generation, token) = self.context.register(id.clone());
        debug!(%id, generation, "Operation started");
        tokio::spawn(drive_operation(
            Arc::clone(&self.executor),
            params,
            id,
            generation,
            token,
            self.events_tx.clone(),
        ));
    }

    /// Cancels a running operation. Unknown ids are ignored.
    pub fn stop_operation(&mut self, id: &OperationId) {
        match self.context.cancel(id) {
            Some(entry) => {
                debug!(%id, generation = entry.generation, handle = ?entry.handle, "Operation stopped");
                self.hooks.on_operation_complete(id);
            }
            None => trace!(%id, "Stop for unknown operation"),
        }
    }

    /// Applies one report from an operation task.
    pub fn on_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Subscribed {
                id,
                generation,
                handle,
            } => {
                if self.context.record_handle(&id, generation, handle) {
                    debug!(%id, %handle, "Subscription registered");
                }
            }
            DriverEvent::Emit {
                id,
                generation,
                message,
            } => {
                if self.context.is_current(&id, generation) {
                    self.send(message);
                } else {
                    trace!(%id, generation, "Dropping result for inactive operation");
                }
            }
            DriverEvent::Finished {
                id,
                generation,
                reason,
            } => {
                if self.context.retire(&id, generation).is_none() {
                    return;
                }
                debug!(%id, ?reason, "Operation finished");
                if reason == FinishReason::Completed {
                    self.send(Message::Complete { id: id.clone() });
                }
                self.hooks.on_operation_complete(&id);
            }
        }
    }

    /// Cancels every running operation and marks the connection closed.
    pub fn shutdown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.keep_alive = None;
        let cancelled = self.context.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled operations on close");
        }
        self.hooks.on_disconnect();
    }

    fn send(&mut self, message: Message) {
        if let Some(outbound) = self.adapter.rewrite_outbound(&message) {
            self.outbox.push_back(encode_message(&outbound));
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sends one operation's reports to its controller.
struct Reporter {
    id: OperationId,
    generation: u64,
    events: mpsc::Sender<DriverEvent>,
    token: CancellationToken,
}

impl Reporter {
    /// Waits for room in the channel; gives up once the operation is
    /// cancelled. Returns whether the message was queued.
    async fn emit(&self, message: Message) -> bool {
        let event = DriverEvent::Emit {
            id: self.id.clone(),
            generation: self.generation,
            message,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn subscribed(&self, handle: SubscriptionHandle) {
        let _ = self
            .events
            .send(DriverEvent::Subscribed {
                id: self.id.clone(),
                generation: self.generation,
                handle,
            })
            .await;
    }

    async fn finish(&self, reason: FinishReason) {
        let _ = self
            .events
            .send(DriverEvent::Finished {
                id: self.id.clone(),
                generation: self.generation,
                reason,
            })
            .await;
    }
}

/// Runs one operation to its end, reporting every step to the controller.
async fn drive_operation(
    executor: Arc<dyn Executor>,
    params: ExecutionParams,
    id: OperationId,
    generation: u64,
    token: CancellationToken,
    events: mpsc::Sender<DriverEvent>,
) {
    let reporter = Reporter {
        id: id.clone(),
        generation,
        events,
        token: token.clone(),
    };

    let sequence: BoxSequence<ExecutionResult> = if executor.is_subscription(&params) {
        let (sequence, sink) = PushSequence::channel();
        let handle = match executor.subscribe(params, sink).await {
            Ok(handle) => handle,
            Err(err) => {
                debug!(%id, error = %err, "Subscribe step failed");
                reporter
                    .emit(Message::Error {
                        id: id.clone(),
                        payload: err.to_payload(),
                    })
                    .await;
                reporter.finish(FinishReason::Failed).await;
                return;
            }
        };

        let source = Arc::clone(&executor);
        sequence.on_release(move || source.unsubscribe(handle));

        reporter.subscribed(handle).await;
        reporter
            .emit(Message::SubscriptionSuccess { id: id.clone() })
            .await;
        Box::new(sequence)
    } else {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = executor.execute(params) => Some(outcome),
        };
        match outcome {
            Some(outcome) => normalize(outcome),
            None => {
                reporter.finish(FinishReason::Cancelled).await;
                return;
            }
        }
    };

    let reason = loop {
        let step = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            step = sequence.advance() => Some(step),
        };

        match step {
            None => break FinishReason::Cancelled,
            Some(Ok(Step::Item(result))) => {
                let delivered = reporter
                    .emit(Message::Data {
                        id: id.clone(),
                        payload: result,
                    })
                    .await;
                if !delivered {
                    break FinishReason::Cancelled;
                }
            }
            Some(Ok(Step::Finished)) => {
                // A cancelled push sequence also reports `Finished`.
                if token.is_cancelled() {
                    break FinishReason::Cancelled;
                }
                break FinishReason::Completed;
            }
            Some(Err(err)) => {
                reporter
                    .emit(Message::Error {
                        id: id.clone(),
                        payload: err.to_payload(),
                    })
                    .await;
                break FinishReason::Failed;
            }
        }
    };

    // Releases the executor's handle for subscriptions.
    if let Err(err) = sequence.cancel().await {
        trace!(%id, error = %err, "Sequence cancel reported an error");
    }
    reporter.finish(reason).await;
}
