use gqlws_core::GraphQLError;
use gqlws_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid operation: {0}")]
    Validation(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Client is closed")]
    Closed,
    #[error("Client is already connected")]
    AlreadyConnected,
}

/// Errors handed to an operation's callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    /// Errors reported by the server for this operation.
    #[error("{}", join_messages(.0))]
    Execution(Vec<GraphQLError>),
    /// No message for the operation arrived in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    ConnectionClosed,
    /// The server answered `connection_init` with an error and closed.
    #[error("Connection rejected: {}", join_messages(.0))]
    ConnectionRejected(Vec<GraphQLError>),
}

impl OperationError {
    pub fn errors(&self) -> &[GraphQLError] {
        match self {
            OperationError::Execution(errors) | OperationError::ConnectionRejected(errors) => errors,
            _ => &[],
        }
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "Unknown error".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
