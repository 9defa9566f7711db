/// Handler declarations and the erased entries the registry stores
use crate::events::{AnyEvent, Event, EventType, HandlerIdentity, Priority};
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::sync::{Arc, Weak};

/// An object that reacts to events.
///
/// Instead of being scanned for tagged methods, a listener hands the registry
/// an explicit list of handler declarations. Declarations are usually built
/// with [`HandlerDecl::new`], which ties the handler to exactly one event type
/// at compile time.
///
/// The registry only keeps a weak reference to the listener. Keep the `Arc`
/// alive for as long as the listener should receive events; handlers of a
/// dropped listener are skipped.
///
/// ```rust
/// use shard_event_system::{Event, HandlerDecl, Listener, Priority};
///
/// #[derive(Debug)]
/// struct Ping { value: u32 }
/// impl Event for Ping {}
///
/// struct PingCounter;
///
/// impl Listener for PingCounter {
///     fn handlers(&self) -> Vec<HandlerDecl<Self>> {
///         vec![HandlerDecl::new("on_ping", Priority::Normal, |_: &Self, ping: &mut Ping| {
///             ping.value += 1;
///             Ok(())
///         })]
///     }
/// }
/// ```
pub trait Listener: Send + Sync + 'static {
    /// The handlers this listener wants registered.
    fn handlers(&self) -> Vec<HandlerDecl<Self>>
    where
        Self: Sized;

    /// Name used in logs and handler identities.
    fn listener_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Trampoline from a listener and an erased event into the real handler.
pub type ListenerHandler<L> = Arc<dyn Fn(&L, &mut AnyEvent) -> anyhow::Result<()> + Send + Sync>;

/// Declared type of one handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamType {
    id: TypeId,
    name: &'static str,
    event: Option<EventType>,
}

impl ParamType {
    /// A parameter that is an event type.
    pub fn event<E: Event>() -> Self {
        let event = EventType::of::<E>();
        Self {
            id: event.id(),
            name: event.name(),
            event: Some(event),
        }
    }

    /// A parameter of any other type.
    pub fn value<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            event: None,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn as_event(&self) -> Option<EventType> {
        self.event
    }
}

/// One handler a listener declares.
pub struct HandlerDecl<L> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) priority: Priority,
    pub(crate) params: Vec<ParamType>,
    pub(crate) invoke: ListenerHandler<L>,
}

impl<L: Listener> HandlerDecl<L> {
    /// Declares a handler for event `E`.
    pub fn new<E, F>(name: impl Into<Cow<'static, str>>, priority: Priority, handler: F) -> Self
    where
        E: Event,
        F: Fn(&L, &mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let invoke: ListenerHandler<L> = Arc::new(move |listener: &L, event: &mut AnyEvent| {
            match event.downcast_mut::<E>() {
                Some(event) => handler(listener, event),
                None => Err(anyhow::anyhow!(
                    "handler expected {} but was given another event type",
                    E::event_name()
                )),
            }
        });

        Self {
            name: name.into(),
            priority,
            params: vec![ParamType::event::<E>()],
            invoke,
        }
    }

    /// Declares a handler from an explicit parameter list and an erased body.
    ///
    /// Intended for generated listeners. The registry validates `params`: only
    /// single-parameter declarations whose parameter is an event are accepted.
    pub fn erased<F>(
        name: impl Into<Cow<'static, str>>,
        priority: Priority,
        params: Vec<ParamType>,
        invoke: F,
    ) -> Self
    where
        F: Fn(&L, &mut AnyEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            params,
            invoke: Arc::new(invoke),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }
}

/// Identity of whoever owns a group of handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerId {
    /// A listener object, identified by the address of its `Arc` allocation.
    Shared(usize),
    /// Closure subscriptions registered through `on`.
    Anonymous(u64),
}

impl ListenerId {
    pub fn of<L: Listener>(listener: &Arc<L>) -> Self {
        ListenerId::Shared(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// What happened when an entry was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Handled,
    ListenerGone,
}

pub(crate) type ErasedHandler =
    Arc<dyn Fn(&mut AnyEvent) -> anyhow::Result<HandlerOutcome> + Send + Sync>;

/// A registered handler. Cheap to clone, so dispatch works on snapshots.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) identity: Arc<HandlerIdentity>,
    pub(crate) listener: ListenerId,
    /// Weak handle on the owning listener; `None` for closures, which the entry owns.
    owner: Option<Weak<dyn Any + Send + Sync>>,
    pub(crate) priority: Priority,
    pub(crate) invoke: ErasedHandler,
}

impl HandlerEntry {
    /// Binds a declaration to a weakly held listener.
    pub(crate) fn bind<L: Listener>(
        listener: &Arc<L>,
        event: EventType,
        decl: HandlerDecl<L>,
    ) -> Self {
        let weak: Weak<L> = Arc::downgrade(listener);
        let owner: Weak<dyn Any + Send + Sync> = weak.clone();
        let invoke = decl.invoke;
        let erased: ErasedHandler = Arc::new(move |event: &mut AnyEvent| match weak.upgrade() {
            Some(listener) => invoke(&*listener, event).map(|()| HandlerOutcome::Handled),
            None => Ok(HandlerOutcome::ListenerGone),
        });

        Self {
            identity: Arc::new(HandlerIdentity {
                listener: listener.listener_name(),
                handler: decl.name.into_owned(),
                event: event.name(),
                priority: decl.priority,
            }),
            listener: ListenerId::of(listener),
            owner: Some(owner),
            priority: decl.priority,
            invoke: erased,
        }
    }

    /// Wraps a closure subscription; the entry owns the closure.
    pub(crate) fn closure<E, F>(id: u64, name: String, priority: Priority, handler: F) -> Self
    where
        E: Event,
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |event: &mut AnyEvent| {
            match event.downcast_mut::<E>() {
                Some(event) => handler(event).map(|()| HandlerOutcome::Handled),
                None => Err(anyhow::anyhow!(
                    "handler expected {} but was given another event type",
                    E::event_name()
                )),
            }
        });

        Self {
            identity: Arc::new(HandlerIdentity {
                listener: "closure",
                handler: name,
                event: E::event_name(),
                priority,
            }),
            listener: ListenerId::Anonymous(id),
            owner: None,
            priority,
            invoke: erased,
        }
    }
}

impl HandlerEntry {
    /// True once the owning listener has been dropped.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.strong_count() == 0)
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("identity", &self.identity)
            .field("listener", &self.listener)
            .finish()
    }
}
