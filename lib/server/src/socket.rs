//! The server-side socket: upgrades an HTTP request, negotiates the
//! subprotocol, and runs the Message Pump (Reader/Dispatcher folded into the
//! frame-driven `ntex` service, Writer, Cleanup) against an opaque
//! [`Executor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ntex::service::{fn_factory_with_config, fn_service, Service};
use ntex::web::{self, ws, Error as WebError, HttpRequest, HttpResponse};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::timeout as tokio_timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use graphql_transport_ws_protocol::{
    breaker, classify_operation, Breaker, ClientMessage, ExecutionContext, ExecutionOutcome,
    Executor, FatalError, GraphQLError, OperationKind, OperationRequest, Registry, ServerMessage,
    SubscribePayload, SubscriptionOutcome, SUBPROTOCOL,
};

use crate::config::ServerConfig;
use crate::hooks::ServerHooks;

/// A handle to a running server-side socket. Returned from [`serve`] alongside
/// the upgrade response so the caller can observe and control the
/// connection's lifecycle independently of the route handler's return value.
#[derive(Clone)]
pub struct ServerSocket {
    breaker: Breaker,
    error: Arc<RwLock<Option<FatalError>>>,
    done: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl ServerSocket {
    /// Blocks until the connection has fully closed.
    pub async fn wait(&self) {
        while !self.closed.load(Ordering::SeqCst) {
            self.done.notified().await;
        }
    }

    /// Triggers an orderly shutdown, as if the connection owner requested it.
    pub fn close(&self) {
        self.breaker.trip(FatalError::terminated_by_user());
    }

    /// The first fatal error observed on this connection, if any.
    pub async fn error(&self) -> Option<FatalError> {
        self.error.read().await.clone()
    }
}

struct Shared<E> {
    executor: Arc<E>,
    hooks: ServerHooks,
    /// Claimed (CAS) the instant a `connection_init` is accepted for
    /// processing, to reject a concurrently dispatched second one. Does not
    /// by itself mean the ack has been sent; see `inited`.
    init_claimed: AtomicBool,
    /// Set only after `connection_ack` has been handed to the outbound
    /// channel. Gates `subscribe` so a concurrently dispatched subscription
    /// can never have its `next`/`error` overtake the ack.
    inited: AtomicBool,
    connection_params: RwLock<Option<serde_json::Value>>,
    registry: Registry<CancellationToken>,
    outbound: mpsc::Sender<ws::Message>,
    breaker: Breaker,
}

/// Route handler suitable for direct registration with an `ntex` app. Drops
/// the [`ServerSocket`] handle after the connection is established; use
/// [`serve`] directly if the caller needs to observe or control the
/// connection's lifecycle.
pub async fn ws_index<E: Executor>(
    req: HttpRequest,
    executor: web::types::State<Arc<E>>,
    config: web::types::State<ServerConfig>,
    hooks: web::types::State<ServerHooks>,
) -> Result<HttpResponse, WebError> {
    let (response, _socket) = serve(
        req,
        executor.get_ref().clone(),
        config.get_ref().clone(),
        hooks.get_ref().clone(),
    )
    .await?;
    Ok(response)
}

/// Upgrades `req` to a WebSocket speaking `graphql-transport-ws` and starts
/// the connection's Message Pump against `executor`. Returns the HTTP
/// response the route handler must return, together with a handle to the
/// running socket.
pub async fn serve<E: Executor>(
    req: HttpRequest,
    executor: Arc<E>,
    config: ServerConfig,
    hooks: ServerHooks,
) -> Result<(HttpResponse, ServerSocket), WebError> {
    let accepted_subprotocol = ws::subprotocols(&req)
        .find(|p| *p == SUBPROTOCOL)
        .map(|_| SUBPROTOCOL);

    let (breaker_tx, breaker_rx) = breaker();
    // `ws::start`'s service factory is a `Fn`, so the single-use `BreakerSignal`
    // is parked behind a lock and taken exactly once when the factory actually
    // runs (once per connection in practice).
    let breaker_rx_slot = Arc::new(std::sync::Mutex::new(Some(breaker_rx)));
    let error_slot: Arc<RwLock<Option<FatalError>>> = Arc::new(RwLock::new(None));
    let done = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));

    let socket = ServerSocket {
        breaker: breaker_tx.clone(),
        error: error_slot.clone(),
        done: done.clone(),
        closed: closed.clone(),
    };

    let response = ws::start(
        req,
        accepted_subprotocol,
        fn_factory_with_config(move |sink: ws::WsSink| {
            let executor = executor.clone();
            let hooks = hooks.clone();
            let config = config.clone();
            let breaker_tx = breaker_tx.clone();
            let breaker_rx_slot = breaker_rx_slot.clone();
            let error_slot = error_slot.clone();
            let done = done.clone();
            let closed = closed.clone();
            async move {
                if accepted_subprotocol.is_none() {
                    debug!("rejecting WebSocket connection: subprotocol not negotiated");
                    let _ = sink
                        .send(FatalError::new(4400, "subprotocol must be graphql-transport-ws").into())
                        .await;
                }

                let (outbound_tx, outbound_rx) = mpsc::channel::<ws::Message>(32);
                let shared = Arc::new(Shared {
                    executor,
                    hooks,
                    init_claimed: AtomicBool::new(false),
                    inited: AtomicBool::new(false),
                    connection_params: RwLock::new(None),
                    registry: Registry::new(),
                    outbound: outbound_tx,
                    breaker: breaker_tx,
                });

                ntex::rt::spawn(writer_task(sink.clone(), outbound_rx));

                ntex::rt::spawn(connection_init_timeout_task(
                    shared.clone(),
                    config.connection_init_timeout,
                ));

                let breaker_rx = breaker_rx_slot.lock().unwrap().take();
                if let Some(breaker_rx) = breaker_rx {
                    ntex::rt::spawn(cleanup_task(
                        sink,
                        breaker_rx,
                        shared.clone(),
                        config,
                        error_slot,
                        done,
                        closed,
                    ));
                }

                build_frame_service(shared)
            }
        }),
    )
    .await?;

    Ok((response, socket))
}

fn build_frame_service<E: Executor>(
    shared: Arc<Shared<E>>,
) -> Result<impl Service<ws::Frame, Response = Option<ws::Message>, Error = std::io::Error>, WebError>
{
    Ok(fn_service(move |frame: ws::Frame| {
        let shared = shared.clone();
        async move {
            match frame {
                ws::Frame::Text(bytes) => {
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            handle_text(shared, text.to_string());
                        }
                        Err(e) => {
                            error!("invalid UTF-8 in WebSocket frame: {}", e);
                            shared
                                .breaker
                                .trip(FatalError::invalid_message("invalid UTF-8 in message"));
                        }
                    }
                    Ok(None)
                }
                ws::Frame::Ping(data) => Ok(Some(ws::Message::Pong(data))),
                ws::Frame::Pong(_) => Ok(None),
                ws::Frame::Binary(_) => {
                    shared
                        .breaker
                        .trip(FatalError::invalid_message("binary frames are not supported"));
                    Ok(None)
                }
                ws::Frame::Close(reason) => {
                    trace!(?reason, "peer sent close frame");
                    Ok(None)
                }
                _ => Ok(None),
            }
        }
    }))
}

/// Decodes `text` and spawns a short-lived handler task for it. This spawn
/// point is the Dispatcher: the frame service itself is the Reader loop,
/// driven by `ntex`'s own I/O dispatch rather than a hand-rolled one.
fn handle_text<E: Executor>(shared: Arc<Shared<E>>, text: String) {
    tokio::spawn(async move {
        let msg: ClientMessage = match sonic_rs::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to decode client message: {}", e);
                shared
                    .breaker
                    .trip(FatalError::invalid_message("message invalid"));
                return;
            }
        };
        if let Err(fatal) = dispatch(&shared, msg).await {
            shared.breaker.trip(fatal);
        }
    });
}

async fn dispatch<E: Executor>(
    shared: &Arc<Shared<E>>,
    msg: ClientMessage,
) -> Result<(), FatalError> {
    match msg {
        ClientMessage::ConnectionInit { payload } => {
            if shared.init_claimed.swap(true, Ordering::SeqCst) {
                return Err(FatalError::too_many_initialisation_requests());
            }
            let payload = payload.unwrap_or_default();
            let ack_payload = (shared.hooks.on_connection_init)(&payload);
            *shared.connection_params.write().await = ack_payload.clone();
            send(shared, ServerMessage::ack(ack_payload)).await;
            shared.inited.store(true, Ordering::SeqCst);
            debug!("connection initialised");
            Ok(())
        }
        ClientMessage::Ping { payload } => {
            let reply = (shared.hooks.on_ping)(payload.as_ref());
            send(shared, ServerMessage::pong(reply)).await;
            Ok(())
        }
        ClientMessage::Pong { payload } => {
            (shared.hooks.on_pong)(payload.as_ref());
            Ok(())
        }
        ClientMessage::Subscribe { id, payload } => handle_subscribe(shared, id, payload).await,
        ClientMessage::Complete { id } => {
            if let Some(stop_signal) = shared.registry.remove(&id).await {
                stop_signal.cancel();
            }
            Ok(())
        }
    }
}

async fn handle_subscribe<E: Executor>(
    shared: &Arc<Shared<E>>,
    id: String,
    payload: SubscribePayload,
) -> Result<(), FatalError> {
    if !shared.inited.load(Ordering::SeqCst) {
        return Err(FatalError::unauthorized());
    }

    let stop_signal = CancellationToken::new();
    if !shared.registry.add(id.clone(), stop_signal.clone()).await {
        return Err(FatalError::subscriber_already_exists(&id));
    }

    let ctx = ExecutionContext::new(
        shared.connection_params.read().await.clone(),
        stop_signal.clone(),
    );
    let request = OperationRequest {
        query: payload.query.clone(),
        operation_name: payload.operation_name.clone(),
        variables: payload.variables.clone(),
        extensions: payload.extensions.clone(),
    };

    let is_subscription =
        classify_operation(&payload.query) == Some(OperationKind::Subscription);

    let shared = shared.clone();
    tokio::spawn(async move {
        if is_subscription {
            run_subscription(&shared, &id, ctx, request).await;
        } else {
            run_single_shot(&shared, &id, ctx, request).await;
        }
        if let Some(token) = shared.registry.remove(&id).await {
            token.cancel();
        }
    });

    Ok(())
}

async fn run_single_shot<E: Executor>(
    shared: &Arc<Shared<E>>,
    id: &str,
    ctx: ExecutionContext,
    request: OperationRequest,
) {
    match shared.executor.execute(ctx, request).await {
        ExecutionOutcome::Ok(result) => {
            send(shared, ServerMessage::next(id, result)).await;
            send(shared, ServerMessage::complete(id)).await;
        }
        ExecutionOutcome::Handlable(errors) => {
            emit_handlable(shared, id, errors).await;
        }
    }
}

async fn run_subscription<E: Executor>(
    shared: &Arc<Shared<E>>,
    id: &str,
    ctx: ExecutionContext,
    request: OperationRequest,
) {
    use futures::StreamExt;

    let stop_signal = ctx.stop_signal().clone();
    match shared.executor.subscribe(ctx, request).await {
        SubscriptionOutcome::Ok(mut stream) => {
            loop {
                tokio::select! {
                    _ = stop_signal.cancelled() => {
                        trace!(id, "subscription cancelled");
                        return;
                    }
                    next = stream.next() => {
                        match next {
                            Some(result) => send(shared, ServerMessage::next(id, result)).await,
                            None => break,
                        }
                    }
                }
            }
            send(shared, ServerMessage::complete(id)).await;
        }
        SubscriptionOutcome::Handlable(errors) => {
            emit_handlable(shared, id, errors).await;
        }
    }
}

async fn emit_handlable<E: Executor>(shared: &Arc<Shared<E>>, id: &str, errors: Vec<GraphQLError>) {
    send(shared, ServerMessage::error(id, errors)).await;
}

async fn send<E>(shared: &Arc<Shared<E>>, msg: ws::Message) {
    if shared.outbound.send(msg).await.is_err() {
        trace!("dropped outbound message, connection is shutting down");
    }
}

async fn writer_task(sink: ws::WsSink, mut outbound_rx: mpsc::Receiver<ws::Message>) {
    while let Some(msg) = outbound_rx.recv().await {
        if sink.send(msg).await.is_err() {
            warn!("failed to write WebSocket message, connection is broken");
            return;
        }
    }
}

async fn connection_init_timeout_task<E>(
    shared: Arc<Shared<E>>,
    connection_init_timeout: std::time::Duration,
) {
    ntex::time::sleep(connection_init_timeout).await;
    if !shared.inited.load(Ordering::SeqCst) {
        debug!("connection initialisation timeout elapsed");
        shared.breaker.trip(FatalError::connection_init_timeout());
    }
}

#[allow(clippy::too_many_arguments)]
async fn cleanup_task<E>(
    sink: ws::WsSink,
    breaker_rx: graphql_transport_ws_protocol::BreakerSignal,
    shared: Arc<Shared<E>>,
    config: ServerConfig,
    error_slot: Arc<RwLock<Option<FatalError>>>,
    done: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let fatal = breaker_rx.wait().await;
    debug!(code = fatal.code, reason = %fatal.reason, "closing connection");

    *error_slot.write().await = Some(fatal.clone());

    let started = Instant::now();
    let write_result = tokio_timeout(config.close_write_deadline(), sink.send(fatal.clone().into())).await;

    for (_, token) in shared.registry.drain().await {
        token.cancel();
    }

    if write_result.is_ok() {
        let remaining = config
            .grace_close_period
            .saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    closed.store(true, Ordering::SeqCst);
    done.notify_waiters();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;
    use serde_json::json;

    use graphql_transport_ws_protocol::{ExecutionContext, ExecutionOutcome, OperationRequest, SubscriptionOutcome};

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
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some((json!({ "data": { "s": "hi" } }), count + 1))
                }
            });
            SubscriptionOutcome::Ok(Box::pin(ticks) as BoxStream<'static, serde_json::Value>)
        }
    }

    fn subscribe_payload(query: &str) -> SubscribePayload {
        SubscribePayload {
            query: query.to_string(),
            operation_name: None,
            variables: Default::default(),
            extensions: None,
        }
    }

    async fn start_test_server(config: ServerConfig) -> String {
        let executor = Arc::new(TestExecutor);
        let hooks = ServerHooks::default();
        let server = web::HttpServer::new(move || {
            web::App::new()
                .state(executor.clone())
                .state(config.clone())
                .state(hooks.clone())
                .route("/ws", web::to(ws_index::<TestExecutor>))
        })
        .bind("127.0.0.1:0")
        .expect("bind ephemeral port");
        let addr = server.addrs()[0];
        ntex::rt::spawn(server.run());
        format!("ws://{addr}/ws")
    }

    async fn dial(url: &str) -> (ws::WsSink, impl futures::Stream<Item = Result<ws::Frame, ws::error::WsClientError>> + Unpin) {
        let connection = ws::WsClient::build(url)
            .header("Sec-WebSocket-Protocol", SUBPROTOCOL)
            .finish()
            .expect("ws client builder")
            .connect()
            .await
            .expect("ws connect")
            .seal();
        let sink = connection.sink();
        let receiver = connection.receiver();
        (sink, receiver)
    }

    async fn read_message(
        receiver: &mut (impl futures::Stream<Item = Result<ws::Frame, ws::error::WsClientError>> + Unpin),
    ) -> ServerMessage {
        loop {
            match receiver.next().await.expect("connection open").expect("frame ok") {
                ws::Frame::Text(bytes) => return sonic_rs::from_slice(&bytes).expect("valid server message"),
                ws::Frame::Ping(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn read_close_code(
        receiver: &mut (impl futures::Stream<Item = Result<ws::Frame, ws::error::WsClientError>> + Unpin),
    ) -> u16 {
        loop {
            match receiver.next().await.expect("connection open").expect("frame ok") {
                ws::Frame::Close(Some(reason)) => return reason.code.into(),
                ws::Frame::Text(_) | ws::Frame::Ping(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[ntex::test]
    async fn connection_init_is_acknowledged() {
        let url = start_test_server(ServerConfig::default()).await;
        let (sink, mut receiver) = dial(&url).await;
        sink.send(ClientMessage::init(None)).await.expect("send init");
        assert!(matches!(read_message(&mut receiver).await, ServerMessage::ConnectionAck { .. }));
    }

    #[ntex::test]
    async fn uninitialised_connection_times_out_with_4408() {
        let mut config = ServerConfig::default();
        config.connection_init_timeout = Duration::from_millis(50);
        let url = start_test_server(config).await;
        let (_sink, mut receiver) = dial(&url).await;
        assert_eq!(read_close_code(&mut receiver).await, 4408);
    }

    #[ntex::test]
    async fn subscribe_before_init_is_rejected_with_4401() {
        let url = start_test_server(ServerConfig::default()).await;
        let (sink, mut receiver) = dial(&url).await;
        sink.send(ClientMessage::subscribe("s1".to_string(), subscribe_payload("{ q }")))
            .await
            .expect("send subscribe");
        assert_eq!(read_close_code(&mut receiver).await, 4401);
    }

    #[ntex::test]
    async fn query_yields_next_then_complete() {
        let url = start_test_server(ServerConfig::default()).await;
        let (sink, mut receiver) = dial(&url).await;
        sink.send(ClientMessage::init(None)).await.expect("send init");
        assert!(matches!(read_message(&mut receiver).await, ServerMessage::ConnectionAck { .. }));

        sink.send(ClientMessage::subscribe("q1".to_string(), subscribe_payload("{ q }")))
            .await
            .expect("send subscribe");

        match read_message(&mut receiver).await {
            ServerMessage::Next { id, payload } => {
                assert_eq!(id, "q1");
                assert_eq!(payload, json!({ "data": { "q": "{ q }" } }));
            }
            other => panic!("expected next, got {other:?}"),
        }
        match read_message(&mut receiver).await {
            ServerMessage::Complete { id } => assert_eq!(id, "q1"),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[ntex::test]
    async fn subscription_streams_at_least_ten_ordered_ticks() {
        let url = start_test_server(ServerConfig::default()).await;
        let (sink, mut receiver) = dial(&url).await;
        sink.send(ClientMessage::init(None)).await.expect("send init");
        assert!(matches!(read_message(&mut receiver).await, ServerMessage::ConnectionAck { .. }));

        sink.send(ClientMessage::subscribe(
            "sub1".to_string(),
            subscribe_payload("subscription { s }"),
        ))
        .await
        .expect("send subscribe");

        for _ in 0..10 {
            match read_message(&mut receiver).await {
                ServerMessage::Next { id, payload } => {
                    assert_eq!(id, "sub1");
                    assert_eq!(payload, json!({ "data": { "s": "hi" } }));
                }
                other => panic!("expected next, got {other:?}"),
            }
        }
    }

    #[ntex::test]
    async fn duplicate_subscription_id_is_rejected_with_4409() {
        let url = start_test_server(ServerConfig::default()).await;
        let (sink, mut receiver) = dial(&url).await;
        sink.send(ClientMessage::init(None)).await.expect("send init");
        assert!(matches!(read_message(&mut receiver).await, ServerMessage::ConnectionAck { .. }));

        let payload = subscribe_payload("subscription { s }");
        sink.send(ClientMessage::subscribe("dup".to_string(), payload.clone()))
            .await
            .expect("send subscribe");
        sink.send(ClientMessage::subscribe("dup".to_string(), payload))
            .await
            .expect("send duplicate subscribe");

        loop {
            match receiver.next().await.expect("connection open").expect("frame ok") {
                ws::Frame::Close(Some(reason)) => {
                    let code: u16 = reason.code.into();
                    assert_eq!(code, 4409);
                    break;
                }
                ws::Frame::Text(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}
