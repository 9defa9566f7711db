/// Completion handle returned by `fire`
use crate::events::EventError;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Resolves to the fired event once every handler has run, or to the error
/// that aborted the dispatch.
///
/// Awaiting is optional: dropping a completion does not cancel the dispatch,
/// the handlers still run to completion (or to the first failure).
#[must_use = "a completion does nothing unless awaited; drop it explicitly to ignore the result"]
pub struct Completion<E> {
    event: &'static str,
    state: CompletionState<E>,
}

enum CompletionState<E> {
    Ready(Option<Result<E, EventError>>),
    Pending(BoxFuture<'static, Result<E, EventError>>),
}

// `E` is only ever moved out of the ready slot, never pinned in place.
impl<E> Unpin for Completion<E> {}

impl<E> Completion<E> {
    pub(crate) fn ready(event_name: &'static str, event: E) -> Self {
        Self {
            event: event_name,
            state: CompletionState::Ready(Some(Ok(event))),
        }
    }

    pub(crate) fn failed(event_name: &'static str, error: EventError) -> Self {
        Self {
            event: event_name,
            state: CompletionState::Ready(Some(Err(error))),
        }
    }

    pub(crate) fn from_task(event_name: &'static str, task: JoinHandle<Result<E, EventError>>) -> Self
    where
        E: Send + 'static,
    {
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(EventError::DispatchAborted {
                    event: event_name,
                    reason: join_error.to_string(),
                }),
            }
        };

        Self {
            event: event_name,
            state: CompletionState::Pending(Box::pin(future)),
        }
    }

    /// True when the result is already available without waiting, as for
    /// events that had no handlers.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, CompletionState::Ready(Some(_)))
    }

    /// Name of the event this completion belongs to.
    pub fn event_name(&self) -> &'static str {
        self.event
    }

    /// Transforms the event carried by a successful completion.
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        E: Send + 'static,
        U: Send + 'static,
        F: FnOnce(E) -> U + Send + 'static,
    {
        let state = match self.state {
            CompletionState::Ready(result) => CompletionState::Ready(result.map(|r| r.map(f))),
            CompletionState::Pending(future) => {
                CompletionState::Pending(Box::pin(async move { future.await.map(f) }))
            }
        };

        Completion {
            event: self.event,
            state,
        }
    }
}

impl<E> Future for Completion<E> {
    type Output = Result<E, EventError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let event = this.event;
        match &mut this.state {
            CompletionState::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(EventError::DispatchAborted {
                    event,
                    reason: "completion polled after it resolved".to_string(),
                })
            })),
            CompletionState::Pending(future) => future.as_mut().poll(cx),
        }
    }
}

impl<E> fmt::Debug for Completion<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            CompletionState::Ready(Some(Ok(_))) => "ready",
            CompletionState::Ready(Some(Err(_))) => "failed",
            CompletionState::Ready(None) => "consumed",
            CompletionState::Pending(_) => "pending",
        };
        f.debug_struct("Completion")
            .field("event", &self.event)
            .field("state", &state)
            .finish()
    }
}
