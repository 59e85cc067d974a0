use std::sync::Arc;

use graphql_transport_ws_protocol::ConnectionInitPayload;

/// Invoked exactly once per connection on receipt of `connection_init`. Its
/// return value becomes both the `connection_ack` payload and the captured
/// connection parameters handed to resolvers.
pub type OnConnectionInit =
    Arc<dyn Fn(&ConnectionInitPayload) -> Option<serde_json::Value> + Send + Sync>;

/// Invoked on receipt of a `ping`; its return value becomes the `pong`
/// payload.
pub type OnPing = Arc<dyn Fn(Option<&serde_json::Value>) -> Option<serde_json::Value> + Send + Sync>;

/// Invoked on receipt of a `pong`. No reply is sent.
pub type OnPong = Arc<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;

/// User-supplied callbacks for a server socket. Every field defaults to a
/// no-op so callers only need to set the hooks they care about.
#[derive(Clone)]
pub struct ServerHooks {
    pub on_connection_init: OnConnectionInit,
    pub on_ping: OnPing,
    pub on_pong: OnPong,
}

impl Default for ServerHooks {
    fn default() -> Self {
        Self {
            on_connection_init: Arc::new(|_| None),
            on_ping: Arc::new(|_| None),
            on_pong: Arc::new(|_| {}),
        }
    }
}
