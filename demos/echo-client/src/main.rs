//! A minimal `graphql-transport-ws` client that subscribes to the echo
//! server's ticking subscription and prints every result it receives.

use std::sync::Arc;
use std::time::Duration;

use graphql_transport_ws_client::{ClientConfig, ClientHooks, SubscriptionHandlers, WsClient};
use graphql_transport_ws_protocol::SubscribePayload;

#[ntex::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::new("ws://127.0.0.1:8080/graphql");
    let client = WsClient::connect(config, ClientHooks::default(), None).await?;

    let handlers = SubscriptionHandlers {
        on_next: Arc::new(|payload| println!("next: {payload}")),
        on_error: Arc::new(|errors| eprintln!("error: {errors:?}")),
        on_complete: Arc::new(|| println!("complete")),
    };

    let unsubscribe = client.subscribe(
        SubscribePayload {
            query: "subscription { s }".to_string(),
            operation_name: None,
            variables: Default::default(),
            extensions: None,
        },
        handlers,
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    unsubscribe();

    client.close();
    client.wait().await;

    Ok(())
}
