pub mod framed;
pub mod memory;
pub mod negotiate;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use framed::{FramedTransport, TextFrameCodec};
pub use memory::ChannelTransport;
pub use negotiate::{select_protocol, Protocol};
pub use transport::{MessageTransport, TransportError};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketClient, WebSocketTransport};
