use crate::transport::{MessageTransport, TransportError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Newline-delimited text frames, for carrying the protocol over a plain
/// byte stream such as TCP.
#[derive(Debug, Clone)]
pub struct TextFrameCodec {
    max_line_length: usize,
}

impl TextFrameCodec {
    pub fn new() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self { max_line_length }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl Default for TextFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TextFrameCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > self.max_line_length {
                    return Err(TransportError::FrameTooLong(src.len()));
                }
                return Ok(None);
            };

            if pos > self.max_line_length {
                return Err(TransportError::FrameTooLong(pos));
            }

            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            // Blank lines are keep-alive noise on raw streams.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return String::from_utf8(line.to_vec())
                .map(Some)
                .map_err(|e| TransportError::InvalidUtf8(e.to_string()));
        }
    }
}

impl Encoder<String> for TextFrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_line_length {
            return Err(TransportError::FrameTooLong(item.len()));
        }
        if item.contains('\n') {
            return Err(TransportError::Protocol(
                "frame must not contain a newline".to_string(),
            ));
        }

        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// [`MessageTransport`] over any byte stream using [`TextFrameCodec`].
#[derive(Debug)]
pub struct FramedTransport<T> {
    inner: Framed<T, TextFrameCodec>,
}

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: T) -> Self {
        Self::with_codec(io, TextFrameCodec::new())
    }

    pub fn with_codec(io: T, codec: TextFrameCodec) -> Self {
        Self {
            inner: Framed::new(io, codec),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<T> MessageTransport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        self.inner.next().await.transpose()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<String>::close(&mut self.inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = TextFrameCodec::new();
        let mut buffer = BytesMut::new();
        codec
            .encode(r#"{"type":"connection_ack"}"#.to_string(), &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..], b"{\"type\":\"connection_ack\"}\n");
    }

    #[test]
    fn test_partial_line_waits_for_more() {
        let mut codec = TextFrameCodec::new();
        let mut buffer = BytesMut::from(&b"{\"type\":"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.put_slice(b"\"ka\"}\r\n{\"type\"");
        assert_eq!(
            codec.decode(&mut buffer).unwrap().as_deref(),
            Some(r#"{"type":"ka"}"#)
        );
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(&buffer[..], b"{\"type\"");
    }

    #[test]
    fn test_multiple_frames_and_blank_lines() {
        let mut codec = TextFrameCodec::new();
        let mut buffer = BytesMut::from(&b"a\n\n  \nb\n"[..]);
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("a"));
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("b"));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = TextFrameCodec::with_max_line_length(8);
        let mut buffer = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(TransportError::FrameTooLong(10))
        ));

        let mut out = BytesMut::new();
        assert!(codec.encode("x".repeat(9), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_embedded_newline_is_rejected() {
        let mut codec = TextFrameCodec::new();
        let mut out = BytesMut::new();
        assert!(matches!(
            codec.encode("a\nb".to_string(), &mut out),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = TextFrameCodec::new();
        let mut buffer = BytesMut::from(&[0xffu8, 0xfe, b'\n'][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(TransportError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_transport_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let mut client = FramedTransport::new(left);
        let mut server = FramedTransport::new(right);

        client
            .send(r#"{"type":"connection_init"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            server.recv().await.unwrap().as_deref(),
            Some(r#"{"type":"connection_init"}"#)
        );

        client.close().await.unwrap();
        drop(client);
        assert_eq!(server.recv().await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut codec = TextFrameCodec::with_max_line_length(64);
            let mut buffer = BytesMut::from(&data[..]);
            while let Ok(Some(_)) = codec.decode(&mut buffer) {}
        }

        #[test]
        fn encoded_lines_decode_back(frame in "[^\n\r]{1,40}") {
            prop_assume!(!frame.trim().is_empty());
            let mut codec = TextFrameCodec::new();
            let mut buffer = BytesMut::new();
            codec.encode(frame.clone(), &mut buffer).unwrap();
            prop_assert_eq!(codec.decode(&mut buffer).unwrap(), Some(frame));
        }
    }
}
