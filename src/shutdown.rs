use std::sync::Arc;

use tokio::sync::Semaphore;

/// A multi-producer, multi-consumer one-shot signal, used for the watcher
/// quit signal and the cooperative-close context's cancel signal.
///
/// - Clone to get another handle; all handles observe the same signal.
/// - [`send`] is idempotent; sending twice is harmless.
/// - Every call to [`recv`] after a signal has been sent completes
///   immediately, i.e. an observed signal stays observable, like reading
///   from a closed channel.
///
/// The implementation (ab)uses the fact that [`acquire`] on a [`Semaphore`]
/// with zero permits only returns once the [`Semaphore`] has been closed.
/// Closing the [`Semaphore`] is equivalent to sending the signal.
///
/// [`send`]: ShutdownSignal::send
/// [`recv`]: ShutdownSignal::recv
/// [`acquire`]: Semaphore::acquire
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Send the signal, waking every current and future [`recv`] caller.
    ///
    /// [`recv`]: ShutdownSignal::recv
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map(|_permit| ())
            .expect_err("Zero-permit semaphore somehow yielded a permit");
    }

    /// Immediately returns whether the signal has been sent.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.inner.is_closed()
    }
}
