use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too long: {0} bytes")]
    FrameTooLong(usize),
    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A bidirectional, message-oriented connection carrying one text frame per
/// protocol message.
///
/// `recv` returns `Ok(None)` once the peer has closed the connection.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: MessageTransport + ?Sized> MessageTransport for Box<T> {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}
