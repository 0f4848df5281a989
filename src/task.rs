use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{error, Instrument};

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of swallowing them, and
/// (2) adds the `#[must_use]` lint so every spawned task is either joined or
///     explicitly [`detach`]ed.
///
/// The watcher joins all of its tasks on stop, so a panicking observer or
/// cooperative waiter resurfaces at the `stop` callsite instead of dying
/// silently in the runtime.
///
/// A [`Task`] also carries a name for debuggability, and the spawned future
/// inherits the [`tracing::Span`] that was current at the spawn site.
///
/// [`detach`]: Task::detach
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> Task<T> {
    /// Spawns a named task which inherits the current span.
    #[inline]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawns a named task with an explicit span instead of the ambient one.
    #[inline]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name: name.into(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls [`is_finished`] on the underlying [`JoinHandle`].
    ///
    /// [`is_finished`]: JoinHandle::is_finished
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Drop the handle, letting the task run on in the background. The task
    /// output (and any panic) is lost, so use sparingly.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(value) => Ok(value),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}
