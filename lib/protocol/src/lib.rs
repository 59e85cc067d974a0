//! Shared wire format, state-machine primitives, and the opaque executor
//! boundary for the `graphql-transport-ws` subprotocol, used by both the
//! server and client crates.

pub mod breaker;
pub mod classify;
pub mod executor;
pub mod message;
pub mod registry;

pub use breaker::{breaker, Breaker, BreakerSignal};
pub use classify::{classify_operation, OperationKind};
pub use executor::{
    ExecutionContext, ExecutionOutcome, Executor, OperationRequest, SubscriptionOutcome,
};
pub use message::{
    ClientMessage, ConnectionInitPayload, FatalError, GraphQLError, GraphQLErrorLocation,
    ServerMessage, SubscribePayload, SUBPROTOCOL,
};
pub use registry::{Registry, SyncRegistry};
