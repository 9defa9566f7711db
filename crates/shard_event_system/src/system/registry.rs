/// Concurrent handler registry keyed by event type
use crate::events::{Event, EventError, EventType, HandlerIdentity, Priority};
use super::handlers::{HandlerEntry, Listener, ListenerId};
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps each event type to the handlers registered for it.
///
/// The table is sharded, so registration for one event type never blocks
/// dispatch of an unrelated one. Handlers for a type are kept in registration
/// order; the dispatcher sorts a snapshot by priority with a stable sort, which
/// makes registration order the tie-break.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: DashMap<TypeId, Vec<HandlerEntry>>,
    next_anonymous: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every handler the listener declares.
    ///
    /// Declarations that do not take exactly one parameter are skipped. A
    /// declaration whose single parameter is not an event is a programming
    /// error and fails the whole registration before anything is inserted.
    pub fn register<L: Listener>(&self, listener: &Arc<L>) -> Result<ListenerId, EventError> {
        let listener_name = listener.listener_name();
        let mut accepted = Vec::new();

        for decl in listener.handlers() {
            let [param] = decl.params.as_slice() else {
                warn!(
                    "Skipping handler {}::{}: expected exactly one parameter, found {}",
                    listener_name,
                    decl.name,
                    decl.params.len()
                );
                continue;
            };

            let Some(event) = param.as_event() else {
                return Err(EventError::HandlerContractViolation {
                    listener: listener_name,
                    handler: decl.name.into_owned(),
                    reason: format!("parameter type {} is not an event", param.name()),
                });
            };

            accepted.push((event, decl));
        }

        let id = ListenerId::of(listener);
        for (event, decl) in accepted {
            debug!(
                "📝 Registering handler {}::{} for {} at {}",
                listener_name, decl.name, event, decl.priority
            );
            let entry = HandlerEntry::bind(listener, event, decl);
            self.insert(event, entry);
        }

        Ok(id)
    }

    /// Registers a standalone closure for event `E`.
    ///
    /// The returned id is the only way to remove it again, via
    /// [`HandlerRegistry::unregister_id`].
    pub fn on<E, F>(&self, name: impl Into<String>, priority: Priority, handler: F) -> ListenerId
    where
        E: Event,
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_anonymous.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        debug!("📝 Registering closure {} for {} at {}", name, E::event_name(), priority);

        let entry = HandlerEntry::closure::<E, F>(id, name, priority, handler);
        self.insert(EventType::of::<E>(), entry);
        ListenerId::Anonymous(id)
    }

    fn insert(&self, event: EventType, entry: HandlerEntry) {
        self.handlers.entry(event.id()).or_default().push(entry);
    }

    /// Removes every handler owned by `listener`. Returns how many were removed.
    pub fn unregister<L: Listener>(&self, listener: &Arc<L>) -> usize {
        self.unregister_id(ListenerId::of(listener))
    }

    /// Removes every handler owned by `id` across all event types.
    pub fn unregister_id(&self, id: ListenerId) -> usize {
        let mut removed = 0;
        self.handlers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.listener != id);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            debug!("🗑️ Unregistered {} handlers of {:?}", removed, id);
        }
        removed
    }

    /// Removes the handlers of listeners that were dropped without
    /// unregistering. Returns how many were removed.
    pub fn prune_dropped(&self) -> usize {
        let mut removed = 0;
        self.handlers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| !entry.is_orphaned());
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            debug!("🗑️ Pruned {} handlers of dropped listeners", removed);
        }
        removed
    }

    /// Drops every registration.
    pub fn clear_all(&self) {
        self.handlers.clear();
        debug!("🗑️ Cleared all event handlers");
    }

    /// Copy of the handlers currently registered for a type, in registration order.
    pub(crate) fn snapshot(&self, event: TypeId) -> Option<Vec<HandlerEntry>> {
        self.handlers
            .get(&event)
            .map(|entries| entries.value().clone())
            .filter(|entries| !entries.is_empty())
    }

    /// Identities of the handlers registered for `E`, in registration order.
    pub fn handlers_for<E: Event>(&self) -> Vec<HandlerIdentity> {
        self.snapshot(TypeId::of::<E>())
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.identity.as_ref().clone())
            .collect()
    }

    /// Total number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Names of the event types that currently have handlers.
    pub fn registered_event_types(&self) -> Vec<&'static str> {
        self.handlers
            .iter()
            .filter_map(|entry| entry.value().first().map(|handler| handler.identity.event))
            .collect()
    }
}
