//! A minimal `graphql-transport-ws` server that echoes the query string back
//! as data, demonstrating the server crate against a toy in-process executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use ntex::web;
use serde_json::json;

use graphql_transport_ws_protocol::{
    ExecutionContext, ExecutionOutcome, Executor, OperationRequest, SubscriptionOutcome,
};
use graphql_transport_ws_server::{ServerConfig, ServerHooks};

struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, _ctx: ExecutionContext, request: OperationRequest) -> ExecutionOutcome {
        ExecutionOutcome::Ok(json!({ "data": { "echo": request.query } }))
    }

    async fn subscribe(
        &self,
        ctx: ExecutionContext,
        _request: OperationRequest,
    ) -> SubscriptionOutcome {
        let stop_signal = ctx.stop_signal().clone();
        let ticks = stream::unfold(0u32, move |count| {
            let stop_signal = stop_signal.clone();
            async move {
                if count >= 20 || stop_signal.is_cancelled() {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some((json!({ "data": { "s": "hi" } }), count + 1))
            }
        });
        SubscriptionOutcome::Ok(Box::pin(ticks) as BoxStream<'static, serde_json::Value>)
    }
}

#[ntex::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let executor = Arc::new(EchoExecutor);
    let config = ServerConfig::default();
    let hooks = ServerHooks::default();

    web::HttpServer::new(move || {
        web::App::new()
            .state(executor.clone())
            .state(config.clone())
            .state(hooks.clone())
            .route(
                "/graphql",
                web::to(graphql_transport_ws_server::ws_index::<EchoExecutor>),
            )
    })
    .bind("127.0.0.1:8080")?
    .run()
    .await?;

    Ok(())
}
