//! The client-side endpoint: dials a server, negotiates the subprotocol, and
//! runs the Message Pump (Reader, Writer, Dispatcher, Cleanup) to multiplex
//! subscriptions back to caller-supplied handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use ntex::ws::{self, WsClient as NtexWsClientBuilder};
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, error, trace, warn};

use graphql_transport_ws_protocol::{
    breaker, Breaker, ClientMessage, ConnectionInitPayload, FatalError, ServerMessage, SubscribePayload,
    SyncRegistry, SUBPROTOCOL,
};

use crate::config::ClientConfig;
use crate::hooks::{ClientHooks, SubscriptionHandlers};

#[derive(Debug, thiserror::Error)]
pub enum WsConnectError {
    #[error("WebSocket client error: {0}")]
    Client(#[from] ws::error::WsClientError),
    #[error("WebSocket client builder error: {0}")]
    Builder(#[from] ws::error::WsClientBuilderError),
    #[error("server did not acknowledge connection_init within the configured timeout")]
    AckTimeout,
}

/// A running client connection.
#[derive(Clone)]
pub struct WsClient {
    outbound: mpsc::Sender<ws::Message>,
    registry: Arc<SyncRegistry<SubscriptionHandlers>>,
    breaker: Breaker,
    error: Arc<RwLock<Option<FatalError>>>,
    done: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl WsClient {
    /// Dials `config.url`, completes the `connection_init`/`connection_ack`
    /// handshake, and returns a client ready to accept subscriptions.
    pub async fn connect(
        config: ClientConfig,
        hooks: ClientHooks,
        init_payload: Option<ConnectionInitPayload>,
    ) -> Result<Self, WsConnectError> {
        // Additional attempts beyond the first retry only the dial itself, not
        // the connection_init/connection_ack handshake that follows.
        let attempts = config.reconnect_attempts + 1;
        let mut attempt = 0;
        let connection = loop {
            match NtexWsClientBuilder::build(&config.url)
                .timeout(ntex::time::Seconds(60))
                .header("Sec-WebSocket-Protocol", SUBPROTOCOL)
                .finish()?
                .connect()
                .await
            {
                Ok(c) => break c,
                Err(e) if attempt + 1 < attempts => {
                    warn!(attempt, "dial attempt failed: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        .seal();

        let sink = connection.sink();
        let mut receiver = connection.receiver();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ws::Message>(32);
        let (breaker_tx, breaker_rx) = breaker();
        let (ack_tx, ack_rx) = oneshot::channel::<Option<serde_json::Value>>();
        let mut ack_tx = Some(ack_tx);

        let registry: Arc<SyncRegistry<SubscriptionHandlers>> = Arc::new(SyncRegistry::new());
        let error_slot: Arc<RwLock<Option<FatalError>>> = Arc::new(RwLock::new(None));
        let done = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        ntex::rt::spawn({
            let sink = sink.clone();
            async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if sink.send(msg).await.is_err() {
                        warn!("failed to write WebSocket message, connection is broken");
                        return;
                    }
                }
            }
        });

        ntex::rt::spawn({
            let sink = sink.clone();
            let registry = registry.clone();
            let breaker_tx = breaker_tx.clone();
            let hooks = hooks.clone();
            async move {
                loop {
                    match receiver.next().await {
                        Some(Ok(ws::Frame::Text(bytes))) => {
                            let text = match std::str::from_utf8(&bytes) {
                                Ok(s) => s.to_string(),
                                Err(e) => {
                                    error!("invalid UTF-8 in server message: {}", e);
                                    breaker_tx.trip(FatalError::invalid_message("invalid UTF-8 in message"));
                                    return;
                                }
                            };
                            handle_server_text(
                                &text,
                                &sink,
                                &registry,
                                &breaker_tx,
                                &hooks,
                                &mut ack_tx,
                            )
                            .await;
                        }
                        Some(Ok(ws::Frame::Ping(data))) => {
                            let _ = sink.send(ws::Message::Pong(data)).await;
                        }
                        Some(Ok(ws::Frame::Close(reason))) => {
                            trace!(?reason, "server closed connection");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket receive error: {}", e);
                            breaker_tx.trip(FatalError::new(4400, "message invalid"));
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        ntex::rt::spawn(cleanup_task(
            sink.clone(),
            breaker_rx,
            registry.clone(),
            config.clone(),
            error_slot.clone(),
            done.clone(),
            closed.clone(),
        ));

        let init_payload = init_payload.unwrap_or_else(|| ConnectionInitPayload {
            fields: match (hooks.on_connecting)() {
                Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
                _ => Default::default(),
            },
        });
        let _ = sink.send(ClientMessage::init(Some(init_payload))).await;

        match tokio_timeout(config.connection_ack_timeout, ack_rx).await {
            Ok(Ok(ack_payload)) => {
                (hooks.on_connected)(ack_payload.as_ref());
                debug!("connection acknowledged");
            }
            _ => {
                breaker_tx.trip(FatalError::connection_ack_timeout());
                return Err(WsConnectError::AckTimeout);
            }
        }

        Ok(Self {
            outbound: outbound_tx,
            registry,
            breaker: breaker_tx,
            error: error_slot,
            done,
            closed,
        })
    }

    /// Starts a subscription. Returns an unsubscribe thunk; calling it more
    /// than once is safe.
    pub fn subscribe(&self, payload: SubscribePayload, handlers: SubscriptionHandlers) -> impl Fn() + Send + Sync + 'static {
        let id = uuid::Uuid::new_v4().to_string();

        self.registry.add(id.clone(), handlers);
        let outbound = self.outbound.clone();
        let outbound_tx = outbound.clone();
        let _ = outbound_tx.try_send(ClientMessage::subscribe(id.clone(), payload));

        let registry = self.registry.clone();
        let unsubscribe_id = id.clone();
        let unsubscribe_outbound = outbound;
        move || {
            if registry.remove(&unsubscribe_id).is_some() {
                let _ = unsubscribe_outbound.try_send(ClientMessage::complete(unsubscribe_id.clone()));
            }
        }
    }

    /// Blocks until the connection has fully closed.
    pub async fn wait(&self) {
        while !self.closed.load(Ordering::SeqCst) {
            self.done.notified().await;
        }
    }

    /// Triggers an orderly shutdown.
    pub fn close(&self) {
        self.breaker.trip(FatalError::terminated_by_user());
    }

    /// The first fatal error observed on this connection, if any.
    pub async fn error(&self) -> Option<FatalError> {
        self.error.read().await.clone()
    }
}

async fn handle_server_text(
    text: &str,
    sink: &ws::WsSink,
    registry: &Arc<SyncRegistry<SubscriptionHandlers>>,
    breaker_tx: &Breaker,
    hooks: &ClientHooks,
    ack_tx: &mut Option<oneshot::Sender<Option<serde_json::Value>>>,
) {
    let msg: ServerMessage = match sonic_rs::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            error!("failed to decode server message: {}", e);
            breaker_tx.trip(FatalError::new(4400, "invalid message received from server"));
            return;
        }
    };

    match msg {
        ServerMessage::ConnectionAck { payload } => {
            if let Some(tx) = ack_tx.take() {
                let _ = tx.send(payload);
            }
        }
        ServerMessage::Ping { payload } => {
            let reply = (hooks.on_ping)(payload.as_ref());
            let _ = sink.send(ServerMessage::pong(reply)).await;
        }
        ServerMessage::Pong { payload } => {
            (hooks.on_pong)(payload.as_ref());
        }
        ServerMessage::Next { id, payload } => {
            let Some(handlers) = registry.get(&id) else {
                breaker_tx.trip(FatalError::new(4400, "subscription not found"));
                return;
            };
            match serde_json::from_value::<GraphQlResultShape>(payload.clone()) {
                Ok(shape) if shape.errors.is_some() => {
                    (handlers.on_error)(shape.errors.unwrap_or_default());
                }
                Ok(_) => (handlers.on_next)(payload),
                Err(e) => {
                    error!("malformed next payload: {}", e);
                    breaker_tx.trip(FatalError::new(4400, "payload of next response invalid"));
                }
            }
        }
        ServerMessage::Error { id, payload } => {
            let Some(handlers) = registry.get(&id) else {
                breaker_tx.trip(FatalError::new(4400, "subscription not found"));
                return;
            };
            (handlers.on_error)(payload);
        }
        ServerMessage::Complete { id } => {
            let Some(handlers) = registry.remove(&id) else {
                breaker_tx.trip(FatalError::new(4400, "subscription not found"));
                return;
            };
            (handlers.on_complete)();
        }
    }
}

#[derive(serde::Deserialize)]
struct GraphQlResultShape {
    #[serde(default)]
    errors: Option<Vec<graphql_transport_ws_protocol::GraphQLError>>,
}

async fn cleanup_task(
    sink: ws::WsSink,
    breaker_rx: graphql_transport_ws_protocol::BreakerSignal,
    registry: Arc<SyncRegistry<SubscriptionHandlers>>,
    config: ClientConfig,
    error_slot: Arc<RwLock<Option<FatalError>>>,
    done: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let fatal = breaker_rx.wait().await;
    debug!(code = fatal.code, reason = %fatal.reason, "closing connection");

    *error_slot.write().await = Some(fatal.clone());

    let started = Instant::now();
    let write_result = tokio_timeout(config.grace_close_period.max(std::time::Duration::from_secs(2)), sink.send(fatal.clone().into())).await;

    for (_, handlers) in registry.drain() {
        (handlers.on_error)(vec![graphql_transport_ws_protocol::GraphQLError::from_message(
            fatal.reason.clone(),
        )]);
    }

    if write_result.is_ok() {
        let remaining = config.grace_close_period.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    closed.store(true, Ordering::SeqCst);
    done.notify_waiters();
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use ntex::web;
    use serde_json::json;

    use graphql_transport_ws_protocol::{ExecutionContext, ExecutionOutcome, Executor, OperationRequest, SubscriptionOutcome};
    use graphql_transport_ws_server::{ServerConfig, ServerHooks};

    use super::*;

    struct TestExecutor;

    #[async_trait]
    impl Executor for TestExecutor {
        async fn execute(&self, _ctx: ExecutionContext, request: OperationRequest) -> ExecutionOutcome {
            ExecutionOutcome::Ok(json!({ "data": { "q": request.query } }))
        }

        async fn subscribe(&self, ctx: ExecutionContext, _request: OperationRequest) -> SubscriptionOutcome {
            let stop_signal = ctx.stop_signal().clone();
            let ticks = stream::unfold(0u32, move |count| {
                let stop_signal = stop_signal.clone();
                async move {
                    if count >= 12 || stop_signal.is_cancelled() {
                        return None;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    Some((json!({ "data": { "s": "hi" } }), count + 1))
                }
            });
            SubscriptionOutcome::Ok(Box::pin(ticks) as BoxStream<'static, serde_json::Value>)
        }
    }

    async fn start_test_server() -> String {
        let executor = Arc::new(TestExecutor);
        let config = ServerConfig::default();
        let hooks = ServerHooks::default();
        let server = web::HttpServer::new(move || {
            web::App::new()
                .state(executor.clone())
                .state(config.clone())
                .state(hooks.clone())
                .route("/ws", web::to(graphql_transport_ws_server::ws_index::<TestExecutor>))
        })
        .bind("127.0.0.1:0")
        .expect("bind ephemeral port");
        let addr = server.addrs()[0];
        ntex::rt::spawn(server.run());
        format!("ws://{addr}/ws")
    }

    fn subscribe_payload(query: &str) -> SubscribePayload {
        SubscribePayload {
            query: query.to_string(),
            operation_name: None,
            variables: Default::default(),
            extensions: None,
        }
    }

    #[ntex::test]
    async fn connects_and_acknowledges() {
        let url = start_test_server().await;
        let client = WsClient::connect(ClientConfig::new(url), ClientHooks::default(), None)
            .await
            .expect("client should connect");
        assert!(client.error().await.is_none());
        client.close();
        client.wait().await;
    }

    #[ntex::test]
    async fn query_delivers_next_then_complete() {
        let url = start_test_server().await;
        let client = WsClient::connect(ClientConfig::new(url), ClientHooks::default(), None)
            .await
            .expect("client should connect");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let complete_tx = tx.clone();
        let handlers = SubscriptionHandlers {
            on_next: Arc::new(move |payload| {
                let _ = tx.send(payload);
            }),
            on_error: Arc::new(|errors| panic!("unexpected error: {errors:?}")),
            on_complete: Arc::new(move || {
                let _ = complete_tx.send(json!({ "complete": true }));
            }),
        };
        client.subscribe(subscribe_payload("{ q }"), handlers);

        let next = rx.recv().await.expect("expected next payload");
        assert_eq!(next, json!({ "data": { "q": "{ q }" } }));
        let complete = rx.recv().await.expect("expected completion signal");
        assert_eq!(complete, json!({ "complete": true }));

        client.close();
        client.wait().await;
    }

    #[ntex::test]
    async fn subscription_delivers_at_least_ten_ticks() {
        let url = start_test_server().await;
        let client = WsClient::connect(ClientConfig::new(url), ClientHooks::default(), None)
            .await
            .expect("client should connect");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = SubscriptionHandlers {
            on_next: Arc::new(move |payload| {
                let _ = tx.send(payload);
            }),
            on_error: Arc::new(|errors| panic!("unexpected error: {errors:?}")),
            on_complete: Arc::new(|| {}),
        };
        let unsubscribe = client.subscribe(subscribe_payload("subscription { s }"), handlers);

        for _ in 0..10 {
            let payload = rx.recv().await.expect("expected a tick");
            assert_eq!(payload, json!({ "data": { "s": "hi" } }));
        }

        unsubscribe();
        client.close();
        client.wait().await;
    }
}
