//! Crate-level error types for dispatch, storage, checkpoints and process managers.

use crate::store::ExpectedVersion;

/// Boxed error type used to carry user-defined domain and handler errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by the event store contract.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream's current version did not match the expected version.
    ///
    /// Nothing was written. Callers that loaded state at `expected` should
    /// reload and decide again.
    #[error("version conflict on {stream_id}: expected {expected:?}, actual {actual}")]
    VersionConflict {
        /// The stream the append targeted.
        stream_id: String,
        /// The expected version supplied with the append.
        expected: ExpectedVersion,
        /// The stream's actual version at the time of the append.
        actual: u64,
    },

    /// The store could not be reached or refused the operation for a
    /// transient reason. Safe to retry.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Error returned when dispatching a command fails.
///
/// [`is_terminal`](DispatchError::is_terminal) separates failures that will
/// never succeed on retry (the command itself is unacceptable) from failures
/// that may clear up (contention, store outages, faulty handlers).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    #[error(transparent)]
    Validation(BoxError),

    /// A middleware link short-circuited the pipeline.
    #[error("command rejected by middleware: {0}")]
    Rejected(String),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt encountered a version conflict with a concurrent writer.
    #[error("optimistic concurrency conflict on {stream_id}: retries exhausted after {attempts} attempts")]
    Conflict {
        /// The contended stream.
        stream_id: String,
        /// Total number of attempts made, including the first.
        attempts: u32,
    },

    /// No aggregate is registered for the command's aggregate type.
    #[error("no aggregate registered for type {0:?}")]
    Routing(String),

    /// The event store stayed unavailable.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    /// The handler panicked, or the command or its events could not be
    /// (de)serialized. Nothing was persisted.
    #[error("handler fault: {0}")]
    HandlerFault(String),
}

impl DispatchError {
    /// Returns `true` when retrying the same command cannot succeed.
    ///
    /// Validation failures, middleware rejections and routing failures are
    /// terminal. Conflicts, store outages and handler faults are not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchError::Validation(_) | DispatchError::Rejected(_) | DispatchError::Routing(_)
        )
    }

    /// Downcast a [`Validation`](DispatchError::Validation) error to the
    /// aggregate's concrete error type.
    ///
    /// # Returns
    ///
    /// `Some(&E)` if this is a validation error of type `E`, `None` otherwise.
    pub fn domain_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            DispatchError::Validation(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Map a store failure that surfaced outside the conflict-retry loop.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { stream_id, .. } => DispatchError::Conflict {
                stream_id,
                attempts: 1,
            },
            StoreError::Unavailable(msg) => DispatchError::StoreUnavailable(msg),
        }
    }
}

/// Error returned by a [`CheckpointStore`](crate::CheckpointStore).
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A compare-and-swap save found a different revision than expected.
    #[error("checkpoint conflict on {process_manager}/{key}: expected revision {expected}, actual {actual}")]
    Conflict {
        /// Process manager name.
        process_manager: String,
        /// Instance key.
        key: String,
        /// Revision the writer loaded.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned while a process manager handles an event.
///
/// Any of these leaves the event unacknowledged; it is delivered again on
/// the next pass and only its own instance is held back.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// `evolve` or `react` returned an error.
    #[error("process manager {process_manager} failed: {source}")]
    Handler {
        /// Process manager name.
        process_manager: &'static str,
        /// The handler's error.
        #[source]
        source: BoxError,
    },

    /// A reaction command failed with a non-terminal dispatch error.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Instance record or cursor persistence failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Subscribing to or reading from the event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A background process manager task exited abnormally.
    #[error("process manager task stopped: {0}")]
    Stopped(String),
}
