use crate::negotiate::Protocol;
use crate::transport::{MessageTransport, TransportError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::ConnectionClosed
            }
            tungstenite::Error::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// WebSocket transport over any tungstenite stream.
///
/// Text frames carry protocol messages; binary frames are accepted when they
/// hold UTF-8. Control frames are handled by tungstenite and never surface.
pub struct WebSocketTransport<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    stream: SplitStream<WebSocketStream<S>>,
    closed: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink,
            stream,
            closed: false,
        }
    }
}

impl<S> std::fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> MessageTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(Some(text.as_str().to_owned())),
                WsMessage::Binary(data) => {
                    return String::from_utf8(data.to_vec())
                        .map(Some)
                        .map_err(|e| TransportError::InvalidUtf8(e.to_string()));
                }
                WsMessage::Close(frame) => {
                    debug!(?frame, "WebSocket closed by peer");
                    self.closed = true;
                    return Ok(None);
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {
                    trace!("Skipping control frame");
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
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Client-side WebSocket connector offering one protocol generation.
#[derive(Debug, Clone)]
pub struct WebSocketClient {
    url: String,
    protocol: Protocol,
}

impl WebSocketClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: Protocol::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connect(
        &self,
    ) -> Result<WebSocketTransport<MaybeTlsStream<TcpStream>>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(format!("Invalid URL {}: {}", self.url, e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(self.protocol.as_str()),
        );

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        let accepted = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!(url = %self.url, offered = %self.protocol, ?accepted, "WebSocket connected");

        Ok(WebSocketTransport::new(stream))
    }
}
