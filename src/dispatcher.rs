//! Command dispatcher: ID assignment, middleware, routing and execution.
//!
//! The [`Dispatcher`] is built once via [`DispatcherBuilder`] with every
//! aggregate type it can route to, its middleware links and an optional
//! observer. It is cheap to clone and safe to share between tasks.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::{CommandContext, CommandEnvelope, CommandMessage};
use crate::correlation::assign;
use crate::error::DispatchError;
use crate::event::RecordedEvent;
use crate::execution::{DEFAULT_MAX_RETRIES, ExecutionConfig, LoadedAggregate, execute, load_aggregate};
use crate::middleware::{DispatchResult, Endpoint, Middleware, MiddlewareChain};
use crate::observer::{NoopObserver, Observer};
use crate::snapshot::SnapshotPolicy;
use crate::store::EventStore;

/// Default number of events between snapshots when a snapshot directory is set.
const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Outcome of a successful dispatch.
///
/// Returned only after the events (if any) are durably appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// The ID assigned to the command.
    pub command_id: Uuid,
    /// The command's correlation ID, also stamped on every event.
    pub correlation_id: Uuid,
    /// The command's causation ID.
    pub causation_id: Option<Uuid>,
    /// Target aggregate type.
    pub aggregate_type: String,
    /// Target aggregate instance.
    pub instance_id: String,
    /// Target stream.
    pub stream_id: String,
    /// Stream version after the append; unchanged for a no-op command.
    pub new_version: u64,
    /// The appended events, empty for a no-op command.
    pub events: Vec<RecordedEvent>,
}

impl DispatchReceipt {
    pub(crate) fn from_message(
        msg: &CommandMessage,
        instance_id: &str,
        stream_id: String,
        new_version: u64,
        events: Vec<RecordedEvent>,
    ) -> Self {
        Self {
            command_id: msg.command_id,
            correlation_id: msg.correlation_id,
            causation_id: msg.causation_id,
            aggregate_type: msg.aggregate_type.clone(),
            instance_id: instance_id.to_string(),
            stream_id,
            new_version,
            events,
        }
    }
}

// --- Type-erased routing ---

/// Type-erased handler for a single aggregate type.
///
/// Each registered aggregate type gets a `TypedRoute<A>` that knows how to
/// deserialize the command JSON and execute it against `A`.
#[async_trait]
pub(crate) trait AggregateRoute: Send + Sync {
    /// The instance a JSON command targets.
    fn instance_id(&self, command: &Value) -> Result<String, DispatchError>;

    /// Execute a command message against the target aggregate.
    async fn execute(
        &self,
        store: &dyn EventStore,
        config: &ExecutionConfig,
        msg: &CommandMessage,
    ) -> DispatchResult;
}

/// Concrete route for aggregate type `A`.
pub(crate) struct TypedRoute<A> {
    // PhantomData to carry the aggregate type without storing a value.
    _marker: PhantomData<A>,
}

impl<A: Aggregate> TypedRoute<A> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Aggregate> AggregateRoute for TypedRoute<A> {
    fn instance_id(&self, command: &Value) -> Result<String, DispatchError> {
        let cmd: A::Command = serde_json::from_value(command.clone()).map_err(|e| {
            DispatchError::HandlerFault(format!(
                "command does not decode for aggregate {}: {e}",
                A::AGGREGATE_TYPE
            ))
        })?;
        Ok(A::instance_id(&cmd))
    }

    async fn execute(
        &self,
        store: &dyn EventStore,
        config: &ExecutionConfig,
        msg: &CommandMessage,
    ) -> DispatchResult {
        execute::<A>(store, config, msg).await
    }
}

/// Innermost link of the chain: route by aggregate type and execute.
struct RouteEndpoint<'a> {
    inner: &'a DispatcherInner,
}

#[async_trait]
impl<'a> Endpoint for RouteEndpoint<'a> {
    async fn call(&self, msg: CommandMessage) -> DispatchResult {
        let Some(route) = self.inner.routes.get(&msg.aggregate_type) else {
            return Err(DispatchError::Routing(msg.aggregate_type));
        };
        route
            .execute(self.inner.store.as_ref(), &self.inner.execution, &msg)
            .await
    }
}

// --- Dispatcher ---

struct DispatcherInner {
    store: Arc<dyn EventStore>,
    routes: HashMap<String, Box<dyn AggregateRoute>>,
    middleware: MiddlewareChain,
    observer: Arc<dyn Observer>,
    execution: ExecutionConfig,
}

/// Routes commands to aggregates through the middleware chain.
///
/// `Clone` is cheap: all state is behind an `Arc`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self.inner.routes.keys().collect();
        routes.sort();
        f.debug_struct("Dispatcher")
            .field("routes", &routes)
            .field("middleware", &self.inner.middleware.len())
            .field("max_retries", &self.inner.execution.max_retries)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start building a dispatcher over `store`.
    pub fn builder(store: Arc<dyn EventStore>) -> DispatcherBuilder {
        DispatcherBuilder::new(store)
    }

    /// Dispatch a typed command to aggregate `A`.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The domain command.
    /// * `ctx` - Actor, causal IDs and initial extensions. Leave both IDs
    ///   unset to start a new workflow.
    ///
    /// # Returns
    ///
    /// A [`DispatchReceipt`] once the resulting events are appended.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Validation`] -- the aggregate rejected the command.
    /// * [`DispatchError::Rejected`] -- a middleware link short-circuited.
    /// * [`DispatchError::Routing`] -- `A` is not registered.
    /// * [`DispatchError::Conflict`] -- the stream stayed contended.
    /// * [`DispatchError::StoreUnavailable`] -- the store failed.
    /// * [`DispatchError::HandlerFault`] -- the handler panicked or the
    ///   command could not be encoded.
    pub async fn dispatch<A: Aggregate>(&self, cmd: A::Command, ctx: CommandContext) -> DispatchResult {
        let envelope = CommandEnvelope::new::<A>(&cmd, ctx)
            .map_err(|e| DispatchError::HandlerFault(format!("command encoding failed: {e}")))?;
        self.dispatch_envelope(envelope).await
    }

    /// Dispatch a type-erased command.
    ///
    /// Used by process managers, which address aggregates by type name.
    /// Errors are the same as for [`dispatch`](Dispatcher::dispatch).
    pub async fn dispatch_envelope(&self, envelope: CommandEnvelope) -> DispatchResult {
        let CommandEnvelope {
            aggregate_type,
            command,
            context,
        } = envelope;

        let ids = assign(context.trigger());
        // Unroutable or undecodable commands still pass through the chain
        // and fail at the endpoint.
        let instance_id = self
            .inner
            .routes
            .get(&aggregate_type)
            .and_then(|route| route.instance_id(&command).ok())
            .unwrap_or_default();
        let command_type = command
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let msg = CommandMessage {
            command_id: Uuid::new_v4(),
            correlation_id: ids.correlation_id,
            causation_id: ids.causation_id,
            aggregate_type,
            instance_id,
            command_type,
            payload: command,
            actor: context.actor,
            extensions: context.metadata,
        };

        let span = tracing::debug_span!(
            "dispatch",
            aggregate_type = %msg.aggregate_type,
            instance_id = %msg.instance_id,
            command_id = %msg.command_id,
            correlation_id = %msg.correlation_id,
        );
        self.inner.observer.before_dispatch(&msg);
        let endpoint = RouteEndpoint { inner: &self.inner };
        let result = self.inner.middleware.run(msg, &endpoint).instrument(span).await;
        if let Ok(receipt) = &result
            && !receipt.events.is_empty()
        {
            self.inner.observer.after_append(receipt);
        }
        result
    }

    /// Rebuild the current state of an aggregate instance.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::StoreUnavailable`] if the stream cannot be
    /// read, or [`DispatchError::HandlerFault`] if `apply` panics.
    pub async fn load<A: Aggregate>(&self, instance_id: &str) -> Result<LoadedAggregate<A>, DispatchError> {
        load_aggregate::<A>(
            self.inner.store.as_ref(),
            instance_id,
            self.inner.execution.snapshots.as_ref(),
        )
        .await
    }

    /// The event store commands are appended to.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    pub(crate) fn observer(&self) -> &Arc<dyn Observer> {
        &self.inner.observer
    }
}

/// Builder for configuring and constructing a [`Dispatcher`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use eventfold_dispatch::{Dispatcher, InMemoryEventStore, TracingMiddleware};
///
/// let dispatcher = Dispatcher::builder(Arc::new(InMemoryEventStore::new()))
///     // .aggregate::<Account>()
///     .middleware(TracingMiddleware)
///     .max_retries(5)
///     .build();
/// ```
pub struct DispatcherBuilder {
    store: Arc<dyn EventStore>,
    routes: HashMap<String, Box<dyn AggregateRoute>>,
    middleware: Vec<Arc<dyn Middleware>>,
    observer: Arc<dyn Observer>,
    max_retries: u32,
    snapshot_dir: Option<PathBuf>,
    snapshot_every: u64,
}

impl DispatcherBuilder {
    fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            routes: HashMap::new(),
            middleware: Vec::new(),
            observer: Arc::new(NoopObserver),
            max_retries: DEFAULT_MAX_RETRIES,
            snapshot_dir: None,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
        }
    }

    /// Register aggregate type `A` for routing.
    ///
    /// Registering the same aggregate type twice keeps the last registration.
    pub fn aggregate<A: Aggregate>(mut self) -> Self {
        self.routes
            .insert(A::AGGREGATE_TYPE.to_string(), Box::new(TypedRoute::<A>::new()));
        self
    }

    /// Append a middleware link. Links run in the order they are added,
    /// the first added being outermost.
    pub fn middleware(mut self, link: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(link));
        self
    }

    /// Install lifecycle hooks.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Additional attempts after a version conflict. Default: 3.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enable file snapshots under `dir`.
    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Events between snapshots once a snapshot directory is set. Default: 100.
    pub fn snapshot_every(mut self, events: u64) -> Self {
        self.snapshot_every = events;
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Dispatcher {
        tracing::debug!(
            aggregates = self.routes.len(),
            middleware_count = self.middleware.len(),
            "dispatcher built"
        );
        let snapshots = self.snapshot_dir.map(|dir| SnapshotPolicy {
            dir,
            every: self.snapshot_every,
        });
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                store: self.store,
                routes: self.routes,
                middleware: MiddlewareChain::new(self.middleware),
                observer: self.observer,
                execution: ExecutionConfig {
                    max_retries: self.max_retries,
                    snapshots,
                },
            }),
        }
    }
}
