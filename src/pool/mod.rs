//! The bounded pool of validated connection handles (spec §4.2), built as a
//! single-owner actor task reached over channels — see [`SPEC_FULL.md`]
//! section A for why this shape was chosen over a lock-guarded pool state,
//! the way the teacher driver's `cmap` subsystem is itself built around
//! `cmap::worker::ConnectionPoolWorker` plus a `PoolManager`/
//! `ConnectionRequester` pair of channel handles.

pub(crate) mod handle;
pub(crate) mod manager;
pub(crate) mod reducer;
pub(crate) mod requester;
pub(crate) mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use handle::TakenSnapshot;
pub(crate) use handle::{PooledHandle, Provenance};

use crate::cache::ConnectionId;
use crate::config::PoolConfig;
use crate::driver::RawConnectionFactory;
use crate::error::Result;
use crate::hooks::HookRegistry;
use crate::runtime::{WorkerHandle, WorkerHandleListener};
use manager::PoolManager;
use reducer::ReducerHandle;
use requester::ConnectionRequester;
use worker::{PoolCounters, PoolWorker};

/// How many checkout requests, and how many management messages, the
/// channels feeding [`PoolWorker`] buffer before a sender awaits. Generous
/// enough that bursts of `take`/`restore` calls don't themselves become a
/// source of backpressure stalls ahead of the real semaphore-equivalent
/// limit (`pool_max_size`).
const CHANNEL_CAPACITY: usize = 256;

/// A bounded pool of [`PooledHandle`]s, cheaply `Clone`-able and
/// `Send + Sync`. Every clone shares the same underlying worker task; the
/// pool itself (and its background reducer, if configured) is kept alive by
/// [`WorkerHandle`] clones held by every live `ObjectPool` — once the last
/// one drops, the worker notices and shuts itself down, destroying every
/// handle it still has available.
#[derive(Clone)]
pub(crate) struct ObjectPool<F: RawConnectionFactory> {
    requester: ConnectionRequester<F>,
    manager: PoolManager<F>,
    _worker_handle: WorkerHandle,
    _reducer: Option<Arc<ReducerHandle>>,
}

impl<F: RawConnectionFactory> ObjectPool<F> {
    /// Spawns the pool's worker task (and, if `reducer_interval` is
    /// configured, its reducer task) and returns a handle to it. Priming to
    /// `pool_initial_size` happens inside the worker before it starts
    /// accepting checkout requests. `hooks` is the frozen registry built by
    /// `DataSource::start()`; the worker fires its `OnInit`/`OnDestroy`
    /// sequences itself, at the one place connections are actually created
    /// and torn down.
    pub(crate) fn new(factory: Arc<F>, config: Arc<PoolConfig>, hooks: Arc<HookRegistry>) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            pool_initial_size = config.pool_initial_size,
            pool_max_size = config.pool_max_size,
            "pool created"
        );
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (manage_tx, manage_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let worker = PoolWorker::new(factory, config.clone(), hooks, request_rx, manage_rx, handle_listener);
        crate::runtime::spawn(worker.run());

        let requester = ConnectionRequester::new(request_tx);
        let manager = PoolManager::new(manage_tx);

        let reducer = config
            .reducer_interval
            .map(|interval| Arc::new(reducer::spawn(manager.clone(), interval)));

        ObjectPool {
            requester,
            manager,
            _worker_handle: worker_handle,
            _reducer: reducer,
        }
    }

    /// Blocks until a handle is available (spec §4.2, `take`).
    pub(crate) async fn take(&self) -> Result<PooledHandle<F>> {
        self.requester.take().await
    }

    /// Blocks until a handle is available, failing with
    /// `ErrorKind::Interrupted` if `cancel` fires first (spec §4.2's
    /// cancellable `take`).
    pub(crate) async fn take_cancellable(&self, cancel: &CancellationToken) -> Result<PooledHandle<F>> {
        self.requester.take_cancellable(cancel).await
    }

    /// Blocks until a handle is available or `timeout` elapses, whichever
    /// comes first (spec §4.2, `tryTake`). The `TimeoutError` returned here
    /// carries no taken-connections snapshot; the facade attaches one (per
    /// `log_taken_connections_on_timeout`) by calling
    /// [`ObjectPool::taken_snapshots`] itself.
    pub(crate) async fn try_take(&self, timeout: Duration) -> Result<PooledHandle<F>> {
        self.requester.try_take(timeout).await
    }

    /// Returns `handle` to the pool. If `valid` is `false` the handle is
    /// destroyed instead of being made available again (spec §4.2,
    /// `restore`).
    pub(crate) async fn restore(&self, handle: PooledHandle<F>, valid: bool) {
        self.manager.restore(handle, valid).await;
    }

    /// Immediately destroys `handle`'s underlying connection, outside of the
    /// normal take/restore flow (spec §4.2, `sever`). The caller (typically
    /// `DataSource::sever_connection`) owns the handle and must have already
    /// taken its raw connection out before calling this, since the worker
    /// only needs to stop counting the handle as taken.
    pub(crate) async fn notify_severed(&self, id: ConnectionId) {
        self.manager.notify_severed(id).await;
    }

    /// A snapshot of every currently-taken handle (spec §6,
    /// `showTakenConnections()`), only meaningful when
    /// `pool_enable_connection_tracking` is set.
    pub(crate) async fn taken_snapshots(&self) -> Vec<TakenSnapshot> {
        self.manager.taken_snapshots().await
    }

    async fn counters(&self) -> PoolCounters {
        self.manager.counters().await
    }

    /// The number of live handles currently issued to callers.
    pub(crate) async fn taken(&self) -> u32 {
        self.counters().await.taken
    }

    /// The number of live handles not currently issued (`created - taken`).
    pub(crate) async fn remaining_created(&self) -> u32 {
        let c = self.counters().await;
        c.created.saturating_sub(c.taken)
    }

    /// The running total of handles ever created by this pool, including
    /// ones since destroyed.
    pub(crate) async fn created_total(&self) -> u64 {
        self.counters().await.created_total
    }

    /// Requests termination and waits for the worker to finish destroying
    /// every available handle (spec §4.8, `DataSource::close()`). Taken
    /// handles are destroyed as they're restored, not forcibly reclaimed —
    /// the spec never specifies forcibly aborting outstanding sessions
    /// (§5: "Outstanding sessions are never forcibly aborted").
    pub(crate) async fn terminate(&self) {
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error;
    use crate::value::Value;

    struct TestFactory {
        created: AtomicU32,
        destroyed: AtomicU32,
        valid: std::sync::atomic::AtomicBool,
    }

    impl TestFactory {
        fn new() -> Self {
            TestFactory {
                created: AtomicU32::new(0),
                destroyed: AtomicU32::new(0),
                valid: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl RawConnectionFactory for TestFactory {
        type Connection = u64;
        type Statement = u32;
        type ResultSet = ();
        type Metadata = ();

        async fn create(&self) -> Result<Self::Connection> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst) as u64)
        }
        async fn validate(&self, _conn: &mut Self::Connection, _test_query: Option<&str>) -> Result<bool> {
            Ok(self.valid.load(Ordering::SeqCst))
        }
        async fn destroy(&self, _conn: Self::Connection) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        async fn prepare_statement(
            &self,
            _conn: &mut Self::Connection,
            _sql: &str,
            _args: &[Value],
        ) -> Result<Self::Statement> {
            Ok(1)
        }
        async fn prepare_call(
            &self,
            _conn: &mut Self::Connection,
            _sql: &str,
            _args: &[Value],
        ) -> Result<Self::Statement> {
            Ok(1)
        }
        async fn create_statement(&self, _conn: &mut Self::Connection) -> Result<Self::Statement> {
            Ok(1)
        }
        async fn close_statement(&self, _stmt: Self::Statement) {}
        async fn execute_query(
            &self,
            _stmt: &mut Self::Statement,
            _sql: &str,
            _args: &[Value],
        ) -> Result<Self::ResultSet> {
            Ok(())
        }
        async fn execute_update(
            &self,
            _stmt: &mut Self::Statement,
            _sql: &str,
            _args: &[Value],
        ) -> Result<u64> {
            Ok(0)
        }
        async fn result_set_next(&self, _rs: &mut Self::ResultSet) -> Result<bool> {
            Ok(false)
        }
        async fn close_result_set(&self, _rs: Self::ResultSet) {}
        async fn metadata(&self, _conn: &mut Self::Connection) -> Result<Self::Metadata> {
            Ok(())
        }
        async fn generated_keys(&self, _stmt: &mut Self::Statement) -> Result<Self::ResultSet> {
            Ok(())
        }
    }

    fn test_config(max_size: u32) -> Arc<PoolConfig> {
        let mut cfg = PoolConfig::default();
        cfg.pool_max_size = max_size;
        cfg.pool_initial_size = 0;
        cfg.reducer_interval = None;
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn take_then_restore_keeps_created_total_stable() {
        let pool = ObjectPool::new(Arc::new(TestFactory::new()), test_config(2), Arc::new(HookRegistry::empty()));
        let handle = pool.take().await.unwrap();
        assert_eq!(pool.created_total().await, 1);
        pool.restore(handle, true).await;
        // give the worker a tick to process the restore
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.taken().await, 0);
        assert_eq!(pool.created_total().await, 1);
    }

    #[tokio::test]
    async fn second_taker_times_out_when_pool_is_saturated() {
        let pool = ObjectPool::new(Arc::new(TestFactory::new()), test_config(1), Arc::new(HookRegistry::empty()));
        let _first = pool.take().await.unwrap();
        let result = pool.try_take(Duration::from_millis(50)).await;
        assert!(matches!(
            result.unwrap_err().kind.as_ref(),
            error::ErrorKind::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_restore_destroys_and_next_take_is_fresh() {
        let factory = Arc::new(TestFactory::new());
        let pool = ObjectPool::new(factory.clone(), test_config(1), Arc::new(HookRegistry::empty()));
        let handle = pool.take().await.unwrap();
        pool.restore(handle, false).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _second = pool.take().await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminate_destroys_available_handles() {
        let factory = Arc::new(TestFactory::new());
        let pool = ObjectPool::new(factory.clone(), test_config(2), Arc::new(HookRegistry::empty()));
        let handle = pool.take().await.unwrap();
        pool.restore(handle, true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.terminate().await;
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let err = pool.take().await.unwrap_err();
        assert!(matches!(err.kind.as_ref(), error::ErrorKind::PoolClosed));
    }

    /// Regression test: an invalid restore under a saturated pool with a
    /// queued waiter must hand the waiter a fresh handle rather than leaving
    /// it parked forever (spec §4.2 non-starvation).
    #[tokio::test]
    async fn invalid_restore_wakes_a_queued_waiter_under_saturation() {
        let factory = Arc::new(TestFactory::new());
        let pool = ObjectPool::new(factory.clone(), test_config(1), Arc::new(HookRegistry::empty()));
        let first = pool.take().await.unwrap();

        let waiting_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiting_pool.take().await });
        // give the waiter time to enqueue before the restore lands.
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.restore(first, false).await;

        let second = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must be woken, not starved")
            .unwrap()
            .unwrap();
        assert_eq!(pool.taken().await, 1);
        drop(second);
    }

    /// Same non-starvation requirement, exercised via an out-of-band sever
    /// instead of an invalid restore.
    #[tokio::test]
    async fn severed_connection_wakes_a_queued_waiter_under_saturation() {
        let factory = Arc::new(TestFactory::new());
        let pool = ObjectPool::new(factory.clone(), test_config(1), Arc::new(HookRegistry::empty()));
        let first = pool.take().await.unwrap();
        let first_id = first.id;

        let waiting_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiting_pool.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.notify_severed(first_id).await;
        drop(first);

        let second = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must be woken, not starved")
            .unwrap()
            .unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn validate_on_restore_destroys_handles_that_fail_validation() {
        let factory = Arc::new(TestFactory::new());
        let mut cfg = PoolConfig::default();
        cfg.pool_max_size = 1;
        cfg.pool_initial_size = 0;
        cfg.reducer_interval = None;
        cfg.validate_on_restore = true;
        let pool = ObjectPool::new(factory.clone(), Arc::new(cfg), Arc::new(HookRegistry::empty()));

        let handle = pool.take().await.unwrap();
        factory.valid.store(false, Ordering::SeqCst);
        pool.restore(handle, true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validate_on_restore_keeps_handles_that_pass_validation() {
        let factory = Arc::new(TestFactory::new());
        let mut cfg = PoolConfig::default();
        cfg.pool_max_size = 1;
        cfg.pool_initial_size = 0;
        cfg.reducer_interval = None;
        cfg.validate_on_restore = true;
        let pool = ObjectPool::new(factory.clone(), Arc::new(cfg), Arc::new(HookRegistry::empty()));

        let handle = pool.take().await.unwrap();
        pool.restore(handle, true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.created_total().await, 1);
    }

    #[tokio::test]
    async fn take_cancellable_returns_interrupted_when_cancelled_before_checkout() {
        let pool = ObjectPool::new(Arc::new(TestFactory::new()), test_config(1), Arc::new(HookRegistry::empty()));
        let _first = pool.take().await.unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let err = pool.take_cancellable(&cancel).await.unwrap_err();
        assert!(matches!(err.kind.as_ref(), error::ErrorKind::Interrupted));
    }

    #[tokio::test]
    async fn take_cancellable_succeeds_when_not_cancelled() {
        let pool = ObjectPool::new(Arc::new(TestFactory::new()), test_config(1), Arc::new(HookRegistry::empty()));
        let cancel = tokio_util::sync::CancellationToken::new();
        let handle = pool.take_cancellable(&cancel).await.unwrap();
        drop(handle);
    }
}
