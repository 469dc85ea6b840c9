//! Small async runtime helpers shared by the pool worker and the background
//! reducer. Kept deliberately thin: `sqlpool` runs on whatever `tokio`
//! runtime the embedder already has, the way the teacher driver's
//! `crate::runtime` module wraps `tokio` rather than owning its own
//! executor.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::mpsc;

/// Spawn a task in the background to run a future.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle {
        handle: tokio::spawn(fut),
    }
}

/// A `Future`-compatible wrapper around `tokio::task::JoinHandle` that
/// collapses the join error (task panicked or was cancelled) into the
/// handle's own output via a panic, matching the teacher's assumption that
/// its internal tasks do not get cancelled out from under it.
pub(crate) struct AsyncJoinHandle<O> {
    handle: tokio::task::JoinHandle<O>,
}

impl<O> AsyncJoinHandle<O> {
    /// Aborts the spawned task. Used by background tasks (the pool reducer)
    /// whose owning handle should stop them on drop rather than leaving
    /// them detached and running forever.
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

impl<O> Future for AsyncJoinHandle<O> {
    type Output = O;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|r| match r {
            Ok(value) => value,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        })
    }
}

/// A cloneable handle that keeps a background worker alive. Once every clone
/// of a given `WorkerHandle` has been dropped, the paired
/// [`WorkerHandleListener`] observes the channel close and the worker can
/// shut itself down. This is the same pattern the teacher driver's CMAP
/// worker uses to know when the last `ConnectionRequester` has gone away.
#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

/// The listening half of a [`WorkerHandle`] channel.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Creates a new handle/listener pair.
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (WorkerHandle { _sender: sender }, WorkerHandleListener { receiver })
    }

    /// Resolves once every [`WorkerHandle`] clone has been dropped.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        // `recv` only returns `None` once every sender has dropped; nothing
        // is ever actually sent on this channel.
        let _ = self.receiver.recv().await;
    }
}
