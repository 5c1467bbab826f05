pub mod codec;
pub mod error;
pub mod executor;
pub mod ids;
pub mod legacy;
pub mod message;
pub mod sequence;

pub use codec::{decode_message, encode_message};
pub use error::{errors_from_payload, ErrorCode, ExecutionError, GraphQLError};
pub use executor::{is_subscription_document, ExecutionParams, Executor, ResultSink};
pub use ids::{OperationId, OperationIdAllocator, SubscriptionHandle};
pub use legacy::LegacyAdapter;
pub use message::{ExecutionResult, Message, MessageError, MessageType, OperationPayload};
pub use sequence::{
    normalize, BoxSequence, EmptySequence, ExecutionOutcome, FailedSequence, PushSender,
    PushSequence, ResultSequence, SingleValue, Step, StreamSequence,
};

/// Sub-protocol offered by clients speaking the current vocabulary.
pub const GRAPHQL_WS: &str = "graphql-ws";
/// Sub-protocol offered by clients speaking the legacy vocabulary.
pub const GRAPHQL_SUBSCRIPTIONS: &str = "graphql-subscriptions";
