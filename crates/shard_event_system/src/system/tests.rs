//! Dispatch tests for the event system

use crate::events::{Event, EventError, Priority};
use crate::system::{EventSystem, HandlerDecl, Listener};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
struct Ping {
    value: u32,
}
impl Event for Ping {
    fn event_name() -> &'static str {
        "test:ping"
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Pong;
impl Event for Pong {}

type Trace = Arc<Mutex<Vec<String>>>;

fn recorder(trace: &Trace, label: &str) -> impl Fn(&mut Ping) -> anyhow::Result<()> + Send + Sync + 'static {
    let trace = trace.clone();
    let label = label.to_string();
    move |_: &mut Ping| {
        trace.lock().unwrap().push(label.clone());
        Ok(())
    }
}

struct PingObserver {
    seen: Mutex<Vec<Ping>>,
}

impl Listener for PingObserver {
    fn handlers(&self) -> Vec<HandlerDecl<Self>> {
        vec![HandlerDecl::new("observe", Priority::Monitor, |observer: &Self, ping: &mut Ping| {
            observer.seen.lock().unwrap().push(ping.clone());
            Ok(())
        })]
    }
}

struct PingPong {
    calls: Mutex<u32>,
}

impl Listener for PingPong {
    fn handlers(&self) -> Vec<HandlerDecl<Self>> {
        vec![
            HandlerDecl::new("on_ping", Priority::Normal, |listener: &Self, _: &mut Ping| {
                *listener.calls.lock().unwrap() += 1;
                Ok(())
            }),
            HandlerDecl::new("on_pong", Priority::Normal, |listener: &Self, _: &mut Pong| {
                *listener.calls.lock().unwrap() += 1;
                Ok(())
            }),
        ]
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_run_in_priority_order() {
    let events = EventSystem::new();
    let trace: Trace = Arc::default();

    for priority in [
        Priority::Monitor,
        Priority::Low,
        Priority::Highest,
        Priority::Lowest,
        Priority::High,
        Priority::Normal,
    ] {
        events.on(priority.to_string(), priority, recorder(&trace, &priority.to_string()));
    }

    events.fire(Ping { value: 0 }).await.unwrap();

    let expected: Vec<String> = Priority::ALL.iter().map(|p| p.to_string()).collect();
    assert_eq!(*trace.lock().unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equal_priorities_keep_registration_order() {
    let trace: Trace = Arc::default();

    let events = EventSystem::new();
    events.on("a", Priority::Normal, recorder(&trace, "a"));
    events.on("b", Priority::Normal, recorder(&trace, "b"));
    events.on("early", Priority::Low, recorder(&trace, "early"));
    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["early", "a", "b"]);

    trace.lock().unwrap().clear();

    let events = EventSystem::new();
    events.on("b", Priority::Normal, recorder(&trace, "b"));
    events.on("early", Priority::Low, recorder(&trace, "early"));
    events.on("a", Priority::Normal, recorder(&trace, "a"));
    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["early", "b", "a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_see_earlier_mutations() {
    let events = EventSystem::new();
    events.on("double", Priority::High, |ping: &mut Ping| {
        ping.value *= 2;
        Ok(())
    });
    events.on("increment", Priority::Low, |ping: &mut Ping| {
        ping.value += 1;
        Ok(())
    });

    let ping = events.fire(Ping { value: 3 }).await.unwrap();
    assert_eq!(ping, Ping { value: 8 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_aborts_the_rest_of_the_dispatch() {
    let events = EventSystem::new();
    let trace: Trace = Arc::default();

    events.on("before", Priority::Low, recorder(&trace, "before"));
    events.on("explode", Priority::Normal, |_: &mut Ping| {
        Err(anyhow::anyhow!("boom"))
    });
    events.on("after", Priority::High, recorder(&trace, "after"));

    let err = events.fire(Ping { value: 1 }).await.unwrap_err();
    match err {
        EventError::HandlerInvocation { handler, source } => {
            assert_eq!(handler.handler, "explode");
            assert_eq!(handler.priority, Priority::Normal);
            assert_eq!(source.to_string(), "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(*trace.lock().unwrap(), vec!["before"]);

    // The failure is isolated to that dispatch.
    let stats = events.get_stats();
    assert_eq!(stats.dispatch_failures, 1);
    assert_eq!(events.registry().handler_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_reported_as_failure() {
    let events = EventSystem::new();
    events.on("panics", Priority::Normal, |_: &mut Ping| -> anyhow::Result<()> {
        panic!("handler bug")
    });

    let err = events.fire(Ping { value: 1 }).await.unwrap_err();
    assert!(matches!(err, EventError::HandlerInvocation { .. }));
    assert!(err.to_string().contains("handler bug"));

    // The bus keeps working afterwards.
    events.clear_all();
    assert_eq!(events.fire(Ping { value: 2 }).await.unwrap(), Ping { value: 2 });
}

#[tokio::test]
async fn fire_without_handlers_completes_immediately() {
    let events = EventSystem::new();
    events.on("pong", Priority::Normal, |_: &mut Pong| Ok(()));

    let completion = events.fire(Ping { value: 7 });
    assert!(completion.is_ready());
    assert_eq!(completion.now_or_never().unwrap().unwrap(), Ping { value: 7 });
    assert_eq!(events.get_stats().events_without_handlers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitor_handler_observes_the_fired_ping() {
    let events = EventSystem::new();
    let observer = Arc::new(PingObserver {
        seen: Mutex::new(Vec::new()),
    });
    events.register(&observer).unwrap();

    let completion = events.fire(Ping { value: 1 });
    assert!(!completion.is_ready());

    let ping = completion.await.unwrap();
    assert_eq!(ping, Ping { value: 1 });
    assert_eq!(*observer.seen.lock().unwrap(), vec![Ping { value: 1 }]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_listener_is_not_invoked_for_any_type() {
    let events = EventSystem::new();
    let listener = Arc::new(PingPong {
        calls: Mutex::new(0),
    });
    events.register(&listener).unwrap();

    events.fire(Ping { value: 1 }).await.unwrap();
    events.fire(Pong).await.unwrap();
    assert_eq!(*listener.calls.lock().unwrap(), 2);

    assert_eq!(events.unregister(&listener), 2);

    assert!(events.fire(Ping { value: 1 }).is_ready());
    assert!(events.fire(Pong).is_ready());
    assert_eq!(*listener.calls.lock().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_listener_is_skipped() {
    let events = EventSystem::new();
    let trace: Trace = Arc::default();
    let observer = Arc::new(PingObserver {
        seen: Mutex::new(Vec::new()),
    });
    events.register(&observer).unwrap();
    events.on("closure", Priority::Normal, recorder(&trace, "closure"));
    drop(observer);

    let ping = events.fire(Ping { value: 5 }).await.unwrap();
    assert_eq!(ping, Ping { value: 5 });
    assert_eq!(*trace.lock().unwrap(), vec!["closure"]);

    // The orphaned handler was removed by that dispatch.
    assert_eq!(events.registry().handler_count(), 1);
    assert_eq!(events.registry().handlers_for::<Ping>()[0].handler, "closure");
}

fn record_handler_thread(events: &EventSystem) -> Arc<Mutex<Vec<ThreadId>>> {
    let threads: Arc<Mutex<Vec<ThreadId>>> = Arc::default();
    let slot = threads.clone();
    events.on("where", Priority::Normal, move |_: &mut Ping| {
        slot.lock().unwrap().push(thread::current().id());
        Ok(())
    });
    threads
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_runs_off_the_calling_thread() {
    let events = EventSystem::new();
    let handler_threads = record_handler_thread(&events);

    events.fire(Ping { value: 0 }).await.unwrap();

    let handler_thread = handler_threads.lock().unwrap()[0];
    assert_ne!(handler_thread, thread::current().id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_from_a_worker_task_leaves_that_worker() {
    let events = Arc::new(EventSystem::new());
    let handler_threads = record_handler_thread(&events);

    let bus = events.clone();
    let caller_threads = tokio::spawn(async move {
        let mut callers = Vec::new();
        for value in 0..20 {
            let caller = thread::current().id();
            bus.fire(Ping { value }).await.unwrap();
            callers.push(caller);
        }
        callers
    })
    .await
    .unwrap();

    let handler_threads = handler_threads.lock().unwrap();
    assert_eq!(handler_threads.len(), 20);
    for (caller, handler) in caller_threads.iter().zip(handler_threads.iter()) {
        assert_ne!(caller, handler);
    }
}

#[tokio::test]
async fn current_thread_runtime_dispatches_elsewhere() {
    let events = EventSystem::new();
    let handler_threads = record_handler_thread(&events);

    events.fire(Ping { value: 0 }).await.unwrap();

    let handler_thread = handler_threads.lock().unwrap()[0];
    assert_ne!(handler_thread, thread::current().id());
}

#[tokio::test]
async fn slow_handler_does_not_stall_the_caller() {
    let events = EventSystem::new();
    events.on("slow", Priority::Normal, |_: &mut Ping| {
        thread::sleep(Duration::from_millis(300));
        Ok(())
    });

    let completion = events.fire(Ping { value: 0 });
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(started.elapsed() < Duration::from_millis(200));

    completion.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_during_dispatch_applies_to_later_fires() {
    let events = EventSystem::new();
    let trace: Trace = Arc::default();
    let registry = events.registry().clone();
    let late_trace = trace.clone();
    let registered = AtomicBool::new(false);

    events.on("register_late", Priority::Low, move |_: &mut Ping| {
        if !registered.swap(true, Ordering::SeqCst) {
            registry.on("late", Priority::Monitor, recorder(&late_trace, "late"));
        }
        Ok(())
    });
    events.on("normal", Priority::Normal, recorder(&trace, "normal"));

    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["normal"]);

    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["normal", "normal", "late"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistration_during_dispatch_applies_to_later_fires() {
    let events = EventSystem::new();
    let trace: Trace = Arc::default();
    let target = events.on("target", Priority::High, recorder(&trace, "target"));

    let registry = events.registry().clone();
    events.on("remove_target", Priority::Low, move |_: &mut Ping| {
        registry.unregister_id(target);
        Ok(())
    });

    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["target"]);

    events.fire(Ping { value: 0 }).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["target"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fires_are_independent() {
    let events = Arc::new(EventSystem::new());
    let total = Arc::new(Mutex::new(0u32));
    let sum = total.clone();
    events.on("sum", Priority::Normal, move |ping: &mut Ping| {
        *sum.lock().unwrap() += ping.value;
        Ok(())
    });

    let completions: Vec<_> = (1..=50).map(|value| events.fire(Ping { value })).collect();
    for completion in futures::future::join_all(completions).await {
        completion.unwrap();
    }

    assert_eq!(*total.lock().unwrap(), (1..=50).sum::<u32>());
    let stats = events.get_stats();
    assert_eq!(stats.events_fired, 50);
    assert_eq!(stats.dispatches_completed, 50);
    assert_eq!(stats.handlers_invoked, 50);
}

#[test]
fn fire_outside_a_runtime_is_aborted() {
    let events = EventSystem::new();
    events.on("noop", Priority::Normal, |_: &mut Ping| Ok(()));

    let completion = events.fire(Ping { value: 1 });
    assert!(completion.is_ready());
    let err = futures::executor::block_on(completion).unwrap_err();
    assert!(matches!(err, EventError::DispatchAborted { event: "test:ping", .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_map_transforms_the_event() {
    let events = EventSystem::new();
    events.on("bump", Priority::Normal, |ping: &mut Ping| {
        ping.value += 1;
        Ok(())
    });

    let value = events.fire(Ping { value: 41 }).map(|ping| ping.value).await.unwrap();
    assert_eq!(value, 42);
}
