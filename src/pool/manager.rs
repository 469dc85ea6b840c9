//! The management side of the pool's message-passing interface: returning,
//! severing, reducing, and querying — everything that isn't a checkout.

use tokio::sync::{mpsc, oneshot};

use crate::cache::ConnectionId;
use crate::driver::RawConnectionFactory;

use super::handle::{PooledHandle, TakenSnapshot};
use super::worker::{ManagementMessage, PoolCounters};

pub(crate) struct PoolManager<F: RawConnectionFactory> {
    sender: mpsc::Sender<ManagementMessage<F>>,
}

impl<F: RawConnectionFactory> Clone for PoolManager<F> {
    fn clone(&self) -> Self {
        PoolManager {
            sender: self.sender.clone(),
        }
    }
}

impl<F: RawConnectionFactory> PoolManager<F> {
    pub(crate) fn new(sender: mpsc::Sender<ManagementMessage<F>>) -> Self {
        PoolManager { sender }
    }

    /// Returns `handle` to the pool (spec §4.2, `restore`). A best-effort
    /// send: if the worker is already gone, the handle is simply dropped,
    /// which runs its `Drop`-based safety-net close.
    pub(crate) async fn restore(&self, handle: PooledHandle<F>, valid: bool) {
        let _ = self.sender.send(ManagementMessage::Restore { handle, valid }).await;
    }

    /// Tells the worker to stop tracking `id` as taken without destroying
    /// anything — the caller (`DataSource::sever_connection`) already
    /// destroyed the raw connection itself.
    pub(crate) async fn notify_severed(&self, id: ConnectionId) {
        let _ = self.sender.send(ManagementMessage::Severed { id }).await;
    }

    pub(crate) async fn reducer_tick(&self) {
        let _ = self.sender.send(ManagementMessage::ReducerTick).await;
    }

    pub(crate) async fn counters(&self) -> PoolCounters {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(ManagementMessage::Counters { reply }).await.is_err() {
            return PoolCounters::default();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn taken_snapshots(&self) -> Vec<TakenSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagementMessage::TakenSnapshots { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Requests termination and waits for the worker to finish destroying
    /// every available handle before returning (spec §4.8, `close()`).
    pub(crate) async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.sender.send(ManagementMessage::Shutdown { done }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}
