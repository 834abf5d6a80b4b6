//! Deferred results of coordinator requests.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use voxgate_core::{Error, Result};

/// The outcome of a request, available once the coordinator decides it.
///
/// Await it from async code or call [`Pending::wait`] from a plain thread.
/// Every request resolves exactly once; if the coordinator shuts down first
/// the result is [`Error::Shutdown`].
#[derive(Debug)]
#[must_use = "a request's outcome is only observable through its Pending"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Sending half kept by the coordinator.
pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Shutdown))
    }

    /// Block for at most `timeout`. Returns `None` if the outcome is still undecided.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return Some(Err(e.into())),
        };
        // The timer must be created inside the runtime.
        runtime
            .block_on(async { tokio::time::timeout(timeout, &mut *self).await })
            .ok()
    }

    /// Take the outcome if it has already been decided.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Shutdown)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Shutdown)))
    }
}
