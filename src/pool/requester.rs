//! The checkout side of the pool's message-passing interface, generalized
//! from the teacher driver's `cmap::ConnectionRequester`.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::driver::RawConnectionFactory;
use crate::error::{self, Result};

use super::handle::PooledHandle;
use super::worker::CheckoutRequest;

/// A cheaply-`Clone`, `Send + Sync` handle callers use to request a
/// connection from the pool worker. Every clone shares the same underlying
/// `mpsc` channel.
pub(crate) struct ConnectionRequester<F: RawConnectionFactory> {
    sender: mpsc::Sender<CheckoutRequest<F>>,
}

impl<F: RawConnectionFactory> Clone for ConnectionRequester<F> {
    fn clone(&self) -> Self {
        ConnectionRequester {
            sender: self.sender.clone(),
        }
    }
}

impl<F: RawConnectionFactory> ConnectionRequester<F> {
    pub(crate) fn new(sender: mpsc::Sender<CheckoutRequest<F>>) -> Self {
        ConnectionRequester { sender }
    }

    /// Blocks until a handle becomes available or the pool is closed (spec
    /// §4.2, `take`).
    pub(crate) async fn take(&self) -> Result<PooledHandle<F>> {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(CheckoutRequest { reply }).await.is_err() {
            return Err(error::ErrorKind::PoolClosed.into());
        }
        rx.await.unwrap_or_else(|_| Err(error::ErrorKind::PoolClosed.into()))
    }

    /// Fails with `TimeoutError` (no attached snapshot — the caller layers
    /// that on per `logTakenConnectionsOnTimeout`) if `timeout` elapses
    /// before a handle is available (spec §4.2, `tryTake`).
    pub(crate) async fn try_take(&self, timeout: Duration) -> Result<PooledHandle<F>> {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(CheckoutRequest { reply }).await.is_err() {
            return Err(error::ErrorKind::PoolClosed.into());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(error::ErrorKind::PoolClosed.into()),
            Err(_) => Err(error::timeout_with_snapshot(None)),
        }
    }

    /// Like [`ConnectionRequester::take`], but returns
    /// `Err(ErrorKind::Interrupted)` promptly if `cancel` fires before a
    /// handle becomes available (spec.md:172, a blocked `take` observing
    /// cancellation). If the checkout already reached the front of the wait
    /// queue or was issued a handle by the time cancellation is observed,
    /// the worker's `issue` still notices the now-closed reply channel and
    /// returns the handle to `available`/the next waiter rather than losing
    /// it.
    pub(crate) async fn take_cancellable(&self, cancel: &CancellationToken) -> Result<PooledHandle<F>> {
        let request = async {
            let (reply, rx) = oneshot::channel();
            if self.sender.send(CheckoutRequest { reply }).await.is_err() {
                return Err(error::ErrorKind::PoolClosed.into());
            }
            rx.await.unwrap_or_else(|_| Err(error::ErrorKind::PoolClosed.into()))
        };
        tokio::select! {
            result = request => result,
            _ = cancel.cancelled() => Err(error::ErrorKind::Interrupted.into()),
        }
    }
}
