//! The boundary between this protocol engine and the opaque GraphQL execution
//! engine. Everything on the other side of [`Executor`] is out of scope for
//! this system: schema validation, planning, resolver execution.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::message::GraphQLError;

/// A single GraphQL operation as received over the wire, stripped of
/// transport concerns.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: HashMap<String, serde_json::Value>,
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

/// Values smuggled into every resolver call: the connection parameters
/// captured at `connection_init`, and (for subscriptions) the stop-signal the
/// resolver must observe to know when to abandon its work.
///
/// An explicit-parameter stand-in for context-value injection, since Rust has
/// no ambient per-request context equivalent.
#[derive(Clone)]
pub struct ExecutionContext {
    connection_params: Option<serde_json::Value>,
    stop_signal: CancellationToken,
}

impl ExecutionContext {
    pub fn new(connection_params: Option<serde_json::Value>, stop_signal: CancellationToken) -> Self {
        Self {
            connection_params,
            stop_signal,
        }
    }

    pub fn connection_params(&self) -> Option<&serde_json::Value> {
        self.connection_params.as_ref()
    }

    pub fn stop_signal(&self) -> &CancellationToken {
        &self.stop_signal
    }
}

/// The result of a single-shot execution (`query`/`mutation`, or the degraded
/// single-result path of a misclassified `subscription`).
pub enum ExecutionOutcome {
    /// A GraphQL response body (`{"data": ..., "errors": ...}` or similar),
    /// to be emitted as a single `next` followed by `complete`.
    Ok(serde_json::Value),
    /// A handlable, per-operation error: emitted as an `error` message, the
    /// connection stays open.
    Handlable(Vec<GraphQLError>),
}

/// The result of starting a subscription (`subscription` operations).
pub enum SubscriptionOutcome {
    /// A lazy stream of response bodies, each emitted as a `next`. Stream end
    /// emits `complete`.
    Ok(BoxStream<'static, serde_json::Value>),
    Handlable(Vec<GraphQLError>),
}

/// The opaque GraphQL execution engine. Implementations may be as simple as
/// an in-memory resolver map or as complex as a full federation executor;
/// this system only ever calls these two entry points.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Execute a `query` or `mutation` operation to completion.
    async fn execute(&self, ctx: ExecutionContext, request: OperationRequest) -> ExecutionOutcome;

    /// Start a `subscription` operation, returning a lazy stream of results.
    async fn subscribe(
        &self,
        ctx: ExecutionContext,
        request: OperationRequest,
    ) -> SubscriptionOutcome;
}
