//! Server endpoint for the `graphql-transport-ws` subprotocol: upgrades an
//! HTTP request and multiplexes GraphQL queries, mutations, and
//! subscriptions onto a single WebSocket connection.

pub mod config;
pub mod hooks;
pub mod socket;

pub use config::ServerConfig;
pub use hooks::ServerHooks;
pub use socket::{serve, ws_index, ServerSocket};

pub use graphql_transport_ws_protocol::{
    ExecutionContext, ExecutionOutcome, Executor, FatalError, GraphQLError, OperationRequest,
    SubscriptionOutcome,
};
