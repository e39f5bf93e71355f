//! Lifecycle hooks for audit and test instrumentation.

use crate::command::CommandMessage;
use crate::dispatcher::DispatchReceipt;
use crate::event::RecordedEvent;

/// Receives notifications at fixed points of dispatch and event processing.
///
/// All hooks default to no-ops. Hooks run inline, so implementations should
/// be cheap and must not block.
pub trait Observer: Send + Sync {
    /// A command has its IDs assigned and is about to enter the middleware chain.
    fn before_dispatch(&self, _msg: &CommandMessage) {}

    /// A command's events were appended.
    fn after_append(&self, _receipt: &DispatchReceipt) {}

    /// A process manager is about to acknowledge `event`.
    fn before_acknowledge(&self, _process_manager: &str, _event: &RecordedEvent) {}
}

/// An [`Observer`] that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
