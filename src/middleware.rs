//! Middleware chain wrapping command dispatch.
//!
//! Links run in registration order: `link_1(link_2(...link_n(dispatch)))`.
//! Each link receives the owned [`CommandMessage`] and a [`Next`]
//! continuation. `Next::run` consumes the continuation, so a link can
//! continue at most once; returning without calling it short-circuits the
//! rest of the chain and the dispatch itself.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::command::CommandMessage;
use crate::dispatcher::DispatchReceipt;
use crate::error::DispatchError;

/// Result type produced by every link and by the dispatch itself.
pub type DispatchResult = Result<DispatchReceipt, DispatchError>;

/// An interceptor around command dispatch.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use eventfold_dispatch::{CommandMessage, DispatchError, DispatchResult, Middleware, Next};
///
/// struct RequireActor;
///
/// #[async_trait]
/// impl Middleware for RequireActor {
///     async fn handle(&self, msg: CommandMessage, next: Next<'_>) -> DispatchResult {
///         if msg.actor.is_none() {
///             return Err(DispatchError::Rejected("anonymous commands are not allowed".into()));
///         }
///         next.run(msg).await
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or rewrite `msg`, then either call `next.run(msg)` or return
    /// early with an error.
    async fn handle(&self, msg: CommandMessage, next: Next<'_>) -> DispatchResult;
}

/// The innermost step of the chain.
#[async_trait]
pub(crate) trait Endpoint: Send + Sync {
    async fn call(&self, msg: CommandMessage) -> DispatchResult;
}

/// The remainder of the chain after the current link.
pub struct Next<'a> {
    links: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl Next<'_> {
    /// Continue with the next link, or with the dispatch itself when this is
    /// the last link.
    pub async fn run(self, msg: CommandMessage) -> DispatchResult {
        match self.links.split_first() {
            Some((link, rest)) => {
                let next = Next {
                    links: rest,
                    endpoint: self.endpoint,
                };
                link.handle(msg, next).await
            }
            None => self.endpoint.call(msg).await,
        }
    }
}

/// An ordered, immutable list of middleware links.
#[derive(Clone, Default)]
pub(crate) struct MiddlewareChain {
    links: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub(crate) fn new(links: Vec<Arc<dyn Middleware>>) -> Self {
        Self { links }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Run `msg` through every link and finally `endpoint`.
    pub(crate) async fn run(&self, msg: CommandMessage, endpoint: &dyn Endpoint) -> DispatchResult {
        Next {
            links: &self.links,
            endpoint,
        }
        .run(msg)
        .await
    }
}

/// Wraps each dispatch in an `info` span and logs its outcome.
///
/// Never alters the message or the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(&self, msg: CommandMessage, next: Next<'_>) -> DispatchResult {
        let span = tracing::info_span!(
            "command",
            command_id = %msg.command_id,
            correlation_id = %msg.correlation_id,
            aggregate_type = %msg.aggregate_type,
            instance_id = %msg.instance_id,
            command_type = %msg.command_type,
        );
        let result = next.run(msg).instrument(span.clone()).await;
        span.in_scope(|| match &result {
            Ok(receipt) => tracing::debug!(
                new_version = receipt.new_version,
                events = receipt.events.len(),
                "command dispatched"
            ),
            Err(e) => tracing::warn!(error = %e, terminal = e.is_terminal(), "command failed"),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn message() -> CommandMessage {
        CommandMessage {
            command_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            aggregate_type: "account".into(),
            instance_id: "a-1".into(),
            command_type: "DepositMoney".into(),
            payload: json!({}),
            actor: None,
            extensions: Default::default(),
        }
    }

    /// Endpoint that records the message it received.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CommandMessage>>,
    }

    #[async_trait]
    impl Endpoint for Recorder {
        async fn call(&self, msg: CommandMessage) -> DispatchResult {
            let receipt = DispatchReceipt {
                command_id: msg.command_id,
                correlation_id: msg.correlation_id,
                causation_id: msg.causation_id,
                aggregate_type: msg.aggregate_type.clone(),
                instance_id: msg.instance_id.clone(),
                stream_id: format!("{}/{}", msg.aggregate_type, msg.instance_id),
                new_version: 0,
                events: Vec::new(),
            };
            self.seen.lock().unwrap().push(msg);
            Ok(receipt)
        }
    }

    /// Appends its name to the `trail` extension on the way in.
    struct Tag(&'static str, Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(&self, mut msg: CommandMessage, next: Next<'_>) -> DispatchResult {
            self.1.lock().unwrap().push(format!("{}:in", self.0));
            let trail = msg
                .extensions
                .entry("trail")
                .or_insert_with(|| json!([]));
            if let Some(items) = trail.as_array_mut() {
                items.push(json!(self.0));
            }
            let result = next.run(msg).await;
            self.1.lock().unwrap().push(format!("{}:out", self.0));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle(&self, _msg: CommandMessage, _next: Next<'_>) -> DispatchResult {
            Err(DispatchError::Rejected("denied".into()))
        }
    }

    #[tokio::test]
    async fn empty_chain_calls_endpoint_directly() {
        let endpoint = Recorder::default();
        let chain = MiddlewareChain::default();
        chain.run(message(), &endpoint).await.unwrap();
        assert_eq!(endpoint.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn links_nest_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            Arc::new(Tag("outer", log.clone())),
            Arc::new(Tag("inner", log.clone())),
        ]);
        let endpoint = Recorder::default();

        chain.run(message(), &endpoint).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["outer:in", "inner:in", "inner:out", "outer:out"]
        );
        let seen = endpoint.seen.lock().unwrap();
        assert_eq!(seen[0].extensions["trail"], json!(["outer", "inner"]));
    }

    #[tokio::test]
    async fn short_circuit_skips_rest_of_chain_and_endpoint() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            Arc::new(Tag("outer", log.clone())),
            Arc::new(Deny),
            Arc::new(Tag("never", log.clone())),
        ]);
        let endpoint = Recorder::default();

        let err = chain.run(message(), &endpoint).await.unwrap_err();

        assert!(matches!(err, DispatchError::Rejected(ref m) if m == "denied"));
        assert_eq!(*log.lock().unwrap(), ["outer:in", "outer:out"]);
        assert!(endpoint.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tracing_middleware_is_transparent() {
        let chain = MiddlewareChain::new(vec![Arc::new(TracingMiddleware)]);
        let endpoint = Recorder::default();
        let msg = message();
        let receipt = chain.run(msg.clone(), &endpoint).await.unwrap();
        assert_eq!(receipt.command_id, msg.command_id);
        assert_eq!(endpoint.seen.lock().unwrap()[0], msg);
    }
}
