// WebSocket client built on the operation multiplexer.
//
// The client owns one connection. A background pump moves frames between the
// multiplexer's outgoing queue and the transport, and hands every inbound
// frame back to the multiplexer.

use crate::error::{ClientError, OperationError};
use crate::multiplexer::{ConnectionState, Multiplexer, MultiplexerOptions, SubscribeOptions};
use gqlws_core::{Message, OperationId};
use gqlws_transport::{MessageTransport, Protocol, WebSocketClient};
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/graphql`
    pub url: String,
    /// Per-operation deadline for the first server message, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Vocabulary spoken on the wire
    pub protocol: Protocol,
    /// Payload of `connection_init`
    pub connection_params: Option<Value>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/graphql".to_string(),
            timeout_ms: None,
            protocol: Protocol::Current,
            connection_params: None,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// What an operation observed, as delivered by [`Client::subscribe_channel`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Acknowledged,
    Data(Value),
    Error(OperationError),
}

struct Driver {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// GraphQL subscriptions client over one WebSocket connection.
///
/// Operations may be started before [`Client::connect`] completes; their
/// `start` frames are queued and sent, in order, once the connection is up.
pub struct Client {
    config: ClientConfig,
    mux: Multiplexer,
    outgoing: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    driver: Mutex<Option<Driver>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("mux", &self.mux)
            .finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (mux, outgoing) = Multiplexer::new(MultiplexerOptions {
            timeout: config.timeout(),
            protocol: config.protocol,
        });
        Self {
            config,
            mux,
            outgoing: Mutex::new(Some(outgoing)),
            driver: Mutex::new(None),
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self::new(ClientConfig {
            url: url.into(),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.mux.state()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Opens the WebSocket named in the config and starts the pump.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let transport = WebSocketClient::new(&self.config.url)
            .with_protocol(self.config.protocol)
            .connect()
            .await
            .inspect_err(|_| self.mux.connection_lost())?;
        self.connect_with(transport).await
    }

    /// Runs the client over an already established transport.
    pub async fn connect_with<T>(&self, mut transport: T) -> Result<(), ClientError>
    where
        T: MessageTransport + 'static,
    {
        let outgoing = self
            .outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ClientError::AlreadyConnected)?;

        let init = self.mux.encode(&Message::ConnectionInit {
            payload: self.config.connection_params.clone(),
        });
        if let Err(err) = transport.send(init).await {
            self.mux.connection_lost();
            return Err(err.into());
        }

        self.mux.mark_open();
        info!(url = %self.config.url, protocol = %self.config.protocol, "Client connected");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(pump(transport, outgoing, self.mux.clone(), shutdown_rx));
        *self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Driver { shutdown, task });
        Ok(())
    }

    /// Starts an operation; see [`Multiplexer::subscribe`].
    pub fn subscribe<F>(&self, options: SubscribeOptions, callback: F) -> Result<OperationId, ClientError>
    where
        F: Fn(Option<OperationError>, Option<Value>) + Send + Sync + 'static,
    {
        self.mux.subscribe(options, callback)
    }

    /// Starts an operation whose events arrive on a channel. The channel
    /// closes once the operation is released.
    pub fn subscribe_channel(
        &self,
        options: SubscribeOptions,
    ) -> Result<(OperationId, mpsc::UnboundedReceiver<OperationEvent>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.mux.subscribe(options, move |error, result| {
            let event = match (error, result) {
                (Some(error), _) => OperationEvent::Error(error),
                (None, Some(data)) => OperationEvent::Data(data),
                (None, None) => OperationEvent::Acknowledged,
            };
            let _ = tx.send(event);
        })?;
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: &OperationId) {
        self.mux.unsubscribe(id);
    }

    pub fn unsubscribe_all(&self) {
        self.mux.unsubscribe_all();
    }

    /// Sends `connection_terminate` after everything already queued, closes
    /// the transport and fails the operations still in flight.
    pub async fn close(&self) {
        self.mux.begin_close();

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(Driver { shutdown, task }) = driver {
            let _ = shutdown.send(());
            if let Err(err) = task.await {
                warn!(error = %err, "Client pump ended abnormally");
            }
        }

        self.mux.connection_lost();
        debug!("Client closed");
    }
}

async fn pump<T: MessageTransport>(
    mut transport: T,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    mux: Multiplexer,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                while let Ok(frame) = outgoing.try_recv() {
                    if transport.send(frame).await.is_err() {
                        break;
                    }
                }
                if let Err(err) = transport.close().await {
                    debug!(error = %err, "Error closing transport");
                }
                break;
            }

            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = transport.send(frame).await {
                        warn!(error = %err, "Send failed, dropping connection");
                        break;
                    }
                }
                None => break,
            },

            inbound = transport.recv() => match inbound {
                Ok(Some(frame)) => mux.handle_frame(&frame),
                Ok(None) => {
                    info!("Server closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "Receive failed, dropping connection");
                    break;
                }
            },
        }
    }

    mux.connection_lost();
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlws_transport::ChannelTransport;
    use serde_json::json;

    async fn next_frame(peer: &mut ChannelTransport) -> Value {
        let frame = peer.recv().await.unwrap().unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol, Protocol::Current);
        assert_eq!(config.timeout(), None);

        let client = Client::with_url("ws://example.invalid/graphql");
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.config().url, "ws://example.invalid/graphql");
    }

    #[tokio::test]
    async fn test_init_carries_connection_params() {
        let client = Client::new(ClientConfig {
            connection_params: Some(json!({"token": "t"})),
            ..Default::default()
        });
        let (local, mut peer) = ChannelTransport::pair();
        client.connect_with(local).await.unwrap();

        assert_eq!(
            next_frame(&mut peer).await,
            json!({"type": "connection_init", "payload": {"token": "t"}})
        );
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let client = Client::new(ClientConfig::default());
        let (a, _peer_a) = ChannelTransport::pair();
        let (b, _peer_b) = ChannelTransport::pair();
        client.connect_with(a).await.unwrap();
        assert!(matches!(
            client.connect_with(b).await,
            Err(ClientError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_sends_terminate_last() {
        let client = Client::new(ClientConfig::default());
        let (local, mut peer) = ChannelTransport::pair();
        client.connect_with(local).await.unwrap();
        let (id, mut events) = client
            .subscribe_channel(SubscribeOptions::new("subscription { s }"))
            .unwrap();

        client.close().await;

        assert_eq!(next_frame(&mut peer).await["type"], "connection_init");
        let start = next_frame(&mut peer).await;
        assert_eq!(start["type"], "start");
        assert_eq!(start["id"], id.to_json());
        assert_eq!(next_frame(&mut peer).await["type"], "connection_terminate");

        assert_eq!(
            events.recv().await,
            Some(OperationEvent::Error(OperationError::ConnectionClosed))
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
