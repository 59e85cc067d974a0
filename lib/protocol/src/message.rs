//! Wire messages for the `graphql-transport-ws` subprotocol:
//! <https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md>

use ntex::web::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

/// The subprotocol both endpoints must negotiate during the WebSocket upgrade.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// A connection-fatal condition. Carries a close code in the 4400-4499 space
/// and a human-readable reason, serialized as the close frame's reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason} (close code {code})")]
pub struct FatalError {
    pub code: u16,
    pub reason: String,
}

impl FatalError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::new(4400, reason.into())
    }

    pub fn unauthorized() -> Self {
        Self::new(4401, "Unauthorized")
    }

    pub fn connection_init_timeout() -> Self {
        Self::new(4408, "Connection initialisation timeout")
    }

    pub fn connection_ack_timeout() -> Self {
        Self::new(4408, "Connection acknowledgement timeout")
    }

    pub fn subscriber_already_exists(id: &str) -> Self {
        Self::new(4409, format!("Subscriber for {id} already exists"))
    }

    pub fn too_many_initialisation_requests() -> Self {
        Self::new(4429, "Too many initialisation requests")
    }

    pub fn terminated_by_user() -> Self {
        Self::new(1000, "terminated by user")
    }
}

impl From<FatalError> for ws::Message {
    fn from(err: FatalError) -> Self {
        ws::Message::Close(Some(ws::CloseReason {
            code: ws::CloseCode::from(err.code),
            description: Some(err.reason),
        }))
    }
}

/// A single GraphQL formatted error, as it appears in the `errors` array of a
/// GraphQL response or in a wire-level `error` message payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<GraphQLErrorLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl GraphQLError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GraphQLErrorLocation {
    pub line: usize,
    pub column: usize,
}

/// The `connection_init` payload is a map of string to arbitrary JSON values.
/// Represented as a flattened map so that every top-level field the peer sent
/// survives a round-trip.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConnectionInitPayload {
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// The payload of a `subscribe` message.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

/// Messages sent by the client (or received by the server).
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<ConnectionInitPayload>,
    },
    Ping {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Complete {
        id: String,
    },
}

impl ClientMessage {
    pub fn init(payload: Option<ConnectionInitPayload>) -> ws::Message {
        ClientMessage::ConnectionInit { payload }.into()
    }

    pub fn ping() -> ws::Message {
        ClientMessage::Ping { payload: None }.into()
    }

    pub fn pong() -> ws::Message {
        ClientMessage::Pong { payload: None }.into()
    }

    pub fn subscribe(id: String, payload: SubscribePayload) -> ws::Message {
        ClientMessage::Subscribe { id, payload }.into()
    }

    pub fn complete(id: String) -> ws::Message {
        ClientMessage::Complete { id }.into()
    }
}

impl From<ClientMessage> for ws::Message {
    fn from(msg: ClientMessage) -> Self {
        match sonic_rs::to_string(&msg) {
            Ok(text) => ws::Message::Text(text.into()),
            Err(e) => {
                error!("Failed to serialize client message to JSON: {}", e);
                FatalError::new(4400, "Internal serialization error").into()
            }
        }
    }
}

/// Messages sent by the server (or received by the client).
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Ping {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Next {
        id: String,
        payload: serde_json::Value,
    },
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    Complete {
        id: String,
    },
}

impl ServerMessage {
    pub fn ack(payload: Option<serde_json::Value>) -> ws::Message {
        ServerMessage::ConnectionAck { payload }.into()
    }

    pub fn ping(payload: Option<serde_json::Value>) -> ws::Message {
        ServerMessage::Ping { payload }.into()
    }

    pub fn pong(payload: Option<serde_json::Value>) -> ws::Message {
        ServerMessage::Pong { payload }.into()
    }

    pub fn next(id: &str, payload: serde_json::Value) -> ws::Message {
        ServerMessage::Next {
            id: id.to_string(),
            payload,
        }
        .into()
    }

    pub fn error(id: &str, errors: Vec<GraphQLError>) -> ws::Message {
        ServerMessage::Error {
            id: id.to_string(),
            payload: errors,
        }
        .into()
    }

    pub fn complete(id: &str) -> ws::Message {
        ServerMessage::Complete { id: id.to_string() }.into()
    }
}

impl From<ServerMessage> for ws::Message {
    fn from(msg: ServerMessage) -> Self {
        match sonic_rs::to_string(&msg) {
            Ok(text) => ws::Message::Text(text.into()),
            Err(e) => {
                error!("Failed to serialize server message to JSON: {}", e);
                FatalError::new(4400, "Internal serialization error").into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trips_subscribe() {
        let json = r#"{"type":"subscribe","id":"u1","payload":{"query":"{ q }"}}"#;
        let msg: ClientMessage = sonic_rs::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { id, payload } => {
                assert_eq!(id, "u1");
                assert_eq!(payload.query, "{ q }");
                assert!(payload.variables.is_empty());
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn connection_init_payload_captures_arbitrary_fields() {
        let json = r#"{"type":"connection_init","payload":{"token":"abc","n":1}}"#;
        let msg: ClientMessage = sonic_rs::from_str(json).unwrap();
        match msg {
            ClientMessage::ConnectionInit { payload } => {
                let payload = payload.unwrap();
                assert_eq!(payload.fields.get("token").unwrap(), "abc");
            }
            _ => panic!("expected ConnectionInit"),
        }
    }

    #[test]
    fn server_message_omits_absent_payload() {
        let msg = ServerMessage::ConnectionAck { payload: None };
        let json = sonic_rs::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connection_ack""#));
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let json = r#"{"type":"bogus"}"#;
        let result: Result<ClientMessage, _> = sonic_rs::from_str(json);
        assert!(result.is_err());
    }
}
