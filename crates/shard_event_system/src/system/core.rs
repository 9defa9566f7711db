/// Core EventSystem implementation
use crate::events::{Event, EventError, Priority};
use super::handlers::{Listener, ListenerId};
use super::registry::HandlerRegistry;
use super::stats::{EventSystemStats, StatsCounters};
use std::sync::Arc;
use tokio::runtime::Handle;

/// The event bus: a handler registry plus the dispatcher that fires into it.
///
/// Construct one per process (or per test) and share it by `Arc`. Dispatches
/// run on the Tokio runtime captured at construction, never on the thread
/// that calls `fire`.
///
/// Separate `fire` calls are not serialized against each other, even for the
/// same event type. Handlers that mutate state outside the event must bring
/// their own synchronization.
pub struct EventSystem {
    /// Registered handlers, shared with anyone holding the registry
    pub(super) registry: Arc<HandlerRegistry>,
    /// Worker pool dispatches are spawned on
    pub(super) runtime: Option<Handle>,
    /// Dispatch counters
    pub(super) stats: Arc<StatsCounters>,
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("handlers", &self.registry.handler_count())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

impl EventSystem {
    /// Creates an event system with an empty registry on the current runtime.
    ///
    /// Outside a Tokio runtime the system still registers handlers, but fires
    /// that need a worker resolve to [`EventError::DispatchAborted`].
    pub fn new() -> Self {
        Self::with_registry(Arc::new(HandlerRegistry::new()))
    }

    /// Creates an event system over an existing registry.
    pub fn with_registry(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            runtime: Handle::try_current().ok(),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Dispatches on the given runtime instead of the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// The registry this system dispatches from.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// See [`HandlerRegistry::register`].
    pub fn register<L: Listener>(&self, listener: &Arc<L>) -> Result<ListenerId, EventError> {
        self.registry.register(listener)
    }

    /// See [`HandlerRegistry::unregister`].
    pub fn unregister<L: Listener>(&self, listener: &Arc<L>) -> usize {
        self.registry.unregister(listener)
    }

    /// See [`HandlerRegistry::on`].
    pub fn on<E, F>(&self, name: impl Into<String>, priority: Priority, handler: F) -> ListenerId
    where
        E: Event,
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.on(name, priority, handler)
    }

    /// See [`HandlerRegistry::unregister_id`].
    pub fn unregister_id(&self, id: ListenerId) -> usize {
        self.registry.unregister_id(id)
    }

    /// See [`HandlerRegistry::clear_all`].
    pub fn clear_all(&self) {
        self.registry.clear_all();
    }

    /// Gets the current event system statistics
    pub fn get_stats(&self) -> EventSystemStats {
        self.stats.snapshot(self.registry.handler_count())
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}
