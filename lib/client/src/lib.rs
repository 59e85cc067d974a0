//! Client endpoint for the `graphql-transport-ws` subprotocol: dials a
//! server, negotiates the handshake, and streams subscription results back
//! to caller-supplied handlers.

pub mod client;
pub mod config;
pub mod hooks;

pub use client::{WsClient, WsConnectError};
pub use config::ClientConfig;
pub use hooks::{ClientHooks, SubscriptionHandlers};

pub use graphql_transport_ws_protocol::{ConnectionInitPayload, FatalError, GraphQLError, SubscribePayload};
