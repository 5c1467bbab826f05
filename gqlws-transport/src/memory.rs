use crate::transport::{MessageTransport, TransportError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// In-process transport: two ends of a pair of unbounded channels.
///
/// Closing one end makes the other end's `recv` return `Ok(None)` once the
/// frames already sent have been drained.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: Some(a_tx),
                rx: a_rx,
            },
            ChannelTransport {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}
