use crate::Server;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap},
    response::Response,
};
use futures::SinkExt;
use gqlws_transport::{select_protocol, MessageTransport, Protocol, TransportError};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// WebSocket handler for GraphQL subscriptions
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(server): State<Arc<Server>>,
) -> Response {
    let protocol = offered_protocol(&headers);
    ws.protocols(protocol.map(Protocol::as_str))
        .on_upgrade(move |socket| handle_socket(socket, server, protocol))
}

/// Protocol to answer with, given every `Sec-WebSocket-Protocol` header the
/// client sent.
fn offered_protocol(headers: &HeaderMap) -> Option<Protocol> {
    let offered: Vec<&str> = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    select_protocol(&offered.join(","))
}

async fn handle_socket(socket: WebSocket, server: Arc<Server>, protocol: Option<Protocol>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(connection = %connection_id, ?protocol, "WebSocket connection established");

    server
        .connection(connection_id.clone())
        .run(AxumTransport::new(socket))
        .await;

    info!(connection = %connection_id, "WebSocket disconnected");
}

/// [`MessageTransport`] over an upgraded axum socket.
#[derive(Debug)]
pub struct AxumTransport {
    socket: WebSocket,
    closed: bool,
}

impl AxumTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

fn transport_error(err: axum::Error) -> TransportError {
    TransportError::WebSocket(err.to_string())
}

#[async_trait]
impl MessageTransport for AxumTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.socket
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(transport_error)
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(msg) = self.socket.recv().await {
            match msg.map_err(transport_error)? {
                WsMessage::Text(text) => return Ok(Some(text.as_str().to_owned())),
                WsMessage::Binary(data) => {
                    return String::from_utf8(data.to_vec())
                        .map(Some)
                        .map_err(|e| TransportError::InvalidUtf8(e.to_string()));
                }
                WsMessage::Close(frame) => {
                    debug!(?frame, "WebSocket closing");
                    self.closed = true;
                    return Ok(None);
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    trace!("Control frame, answered by axum");
                }
            }
        }
        self.closed = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone; nothing left to report then.
        let _ = SinkExt::close(&mut self.socket).await;
        Ok(())
    }
}
