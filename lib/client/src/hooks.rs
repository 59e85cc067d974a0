use std::sync::Arc;

/// Invoked when dialing begins, to build the `connection_init` payload.
pub type OnConnecting = Arc<dyn Fn() -> Option<serde_json::Value> + Send + Sync>;

/// Invoked once `connection_ack` is received.
pub type OnConnected = Arc<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;

/// Invoked on receipt of a `ping`; its return value becomes the `pong`
/// payload.
pub type OnPing = Arc<dyn Fn(Option<&serde_json::Value>) -> Option<serde_json::Value> + Send + Sync>;

/// Invoked on receipt of a `pong`.
pub type OnPong = Arc<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;

/// User-supplied callbacks for a client connection. Every field defaults to
/// a no-op.
#[derive(Clone)]
pub struct ClientHooks {
    pub on_connecting: OnConnecting,
    pub on_connected: OnConnected,
    pub on_ping: OnPing,
    pub on_pong: OnPong,
}

impl Default for ClientHooks {
    fn default() -> Self {
        Self {
            on_connecting: Arc::new(|| None),
            on_connected: Arc::new(|_| {}),
            on_ping: Arc::new(|_| None),
            on_pong: Arc::new(|_| {}),
        }
    }
}

/// Per-subscription callbacks supplied to [`crate::client::WsClient::subscribe`].
/// Absent handlers default to no-ops.
#[derive(Clone)]
pub struct SubscriptionHandlers {
    pub on_next: Arc<dyn Fn(serde_json::Value) + Send + Sync>,
    pub on_error: Arc<dyn Fn(Vec<graphql_transport_ws_protocol::GraphQLError>) + Send + Sync>,
    pub on_complete: Arc<dyn Fn() + Send + Sync>,
}

impl Default for SubscriptionHandlers {
    fn default() -> Self {
        Self {
            on_next: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_complete: Arc::new(|| {}),
        }
    }
}
