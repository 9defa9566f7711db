/// Event dispatch
use crate::events::{AnyEvent, Event, EventError};
use super::completion::Completion;
use super::core::EventSystem;
use super::handlers::{HandlerEntry, HandlerOutcome};
use super::stats::StatsCounters;
use std::any::{Any, TypeId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace, warn};

impl EventSystem {
    /// Fires an event at every handler registered for its exact type.
    ///
    /// With no handlers the returned completion is already resolved with the
    /// original event. Otherwise the current handlers are snapshotted, sorted
    /// by priority slot (registration order breaks ties) and run one after
    /// another on the runtime's blocking pool. The first handler error aborts
    /// the rest of this dispatch. Handlers of dropped listeners are skipped and
    /// then removed from the registry.
    pub fn fire<E: Event>(&self, event: E) -> Completion<E> {
        let event_name = E::event_name();
        self.stats.record_fire();
        trace!("🔥 Firing {}", event_name);

        let Some(mut handlers) = self.registry.snapshot(TypeId::of::<E>()) else {
            self.stats.record_fast_path();
            return Completion::ready(event_name, event);
        };

        // Stable: equal priorities keep registration order.
        handlers.sort_by_key(|handler| handler.priority.slot());

        let Some(runtime) = &self.runtime else {
            self.stats.record_outcome(false);
            return Completion::failed(
                event_name,
                EventError::DispatchAborted {
                    event: event_name,
                    reason: "event system was created outside a Tokio runtime".to_string(),
                },
            );
        };

        let stats = self.stats.clone();
        let registry = self.registry.clone();
        // Handlers are synchronous; the blocking pool keeps them off every
        // runtime worker, including the one `fire` was called from.
        let task = runtime.spawn_blocking(move || {
            let (result, dropped) = run_handlers(event, &handlers, &stats);
            if dropped > 0 {
                registry.prune_dropped();
            }
            stats.record_outcome(result.is_ok());
            result
        });

        Completion::from_task(event_name, task)
    }
}

/// Runs a sorted handler sequence against one event. Also returns how many
/// handlers belonged to dropped listeners.
fn run_handlers<E: Event>(
    mut event: E,
    handlers: &[HandlerEntry],
    stats: &Arc<StatsCounters>,
) -> (Result<E, EventError>, usize) {
    let mut dropped = 0;
    for handler in handlers {
        let invocation = panic::catch_unwind(AssertUnwindSafe(|| {
            let erased: &mut AnyEvent = &mut event;
            (handler.invoke)(erased)
        }));

        match invocation {
            Ok(Ok(HandlerOutcome::Handled)) => stats.record_invocation(),
            Ok(Ok(HandlerOutcome::ListenerGone)) => {
                dropped += 1;
                warn!(
                    "⚠️ Removing {}: its listener was dropped without unregistering",
                    handler.identity
                );
            }
            Ok(Err(source)) => {
                error!("❌ Handler {} failed: {:#}", handler.identity, source);
                let error = EventError::HandlerInvocation {
                    handler: handler.identity.as_ref().clone(),
                    source,
                };
                return (Err(error), dropped);
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!("💥 Handler {} panicked: {}", handler.identity, message);
                let error = EventError::HandlerInvocation {
                    handler: handler.identity.as_ref().clone(),
                    source: anyhow::anyhow!("handler panicked: {message}"),
                };
                return (Err(error), dropped);
            }
        }
    }

    (Ok(event), dropped)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
