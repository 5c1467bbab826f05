//! Client side of the GraphQL-over-WebSocket transport.
//!
//! [`Multiplexer`] is the transport-independent core: it numbers operations,
//! routes server messages to per-operation callbacks and queues frames until
//! the connection opens. [`Client`] drives a multiplexer over a WebSocket.

pub mod client;
pub mod error;
pub mod multiplexer;

pub use client::{Client, ClientConfig, OperationEvent};
pub use error::{ClientError, OperationError};
pub use gqlws_transport::Protocol;
pub use multiplexer::{
    ConnectionState, Multiplexer, MultiplexerOptions, OperationCallback, SubscribeOptions,
};
