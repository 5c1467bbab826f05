pub mod connection;
pub mod context;
pub mod hooks;
pub mod logging;
pub mod server;
pub mod ws_h1;

pub use connection::{
    ConnectionConfig, ConnectionController, ConnectionState, DriverEvent, FinishReason, Flow,
    DEFAULT_EVENT_BUFFER,
};
pub use context::{ConnectionContext, OperationEntry};
pub use hooks::{DefaultHooks, ServerHooks};
pub use logging::{init_console_logging, init_logging, init_test_logging};
pub use server::{Server, ServerConfig, ServerError};
pub use ws_h1::AxumTransport;
