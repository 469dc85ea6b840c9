//! The connection-level proxy (spec §4.7.1): the virtual handle an embedder
//! gets back from `DataSource::get()`. Borrows exactly one
//! [`PooledHandle`] for its lifetime and translates `close`/`abort` into
//! "return to pool" rather than "destroy" (spec §1's framing of the whole
//! system: pool `close` means give back, not tear down).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{ConnectionId, MethodIdentity, StatementHolder, StatementKey};
use crate::collector::ExceptionCollector;
use crate::config::PoolConfig;
use crate::driver::RawConnectionFactory;
use crate::error::{self, Result};
use crate::hooks::HookRegistry;
use crate::pool::{ObjectPool, PooledHandle};
use crate::value::Value;

use super::metadata::MetadataProxy;
use super::statement::StatementProxy;

struct ConnectionInner<F: RawConnectionFactory> {
    factory: Arc<F>,
    pool: ObjectPool<F>,
    hooks: Arc<HookRegistry>,
    config: Arc<PoolConfig>,
    collector: ExceptionCollector,
    closed: AtomicBool,
    state: AsyncMutex<Option<PooledHandle<F>>>,
}

/// A virtual connection handle (spec §3, `ConnectionProxy`'s conceptual
/// home). Cheaply `Clone`: every clone shares the same underlying pooled
/// handle, which is appropriate here since descendants (`StatementProxy`,
/// `MetadataProxy`) need to hold a live reference back to their owning
/// connection to answer `getConnection()`. Spec §5 still expects the
/// *caller* to serialize method calls against one borrowed connection —
/// `sqlpool` does not hand the same checked-out handle to two independent
/// callers.
pub struct ConnectionProxy<F: RawConnectionFactory> {
    inner: Arc<ConnectionInner<F>>,
}

impl<F: RawConnectionFactory> Clone for ConnectionProxy<F> {
    fn clone(&self) -> Self {
        ConnectionProxy {
            inner: self.inner.clone(),
        }
    }
}

impl<F: RawConnectionFactory> ConnectionProxy<F> {
    pub(crate) fn new(
        handle: PooledHandle<F>,
        factory: Arc<F>,
        pool: ObjectPool<F>,
        hooks: Arc<HookRegistry>,
        config: Arc<PoolConfig>,
    ) -> Self {
        ConnectionProxy {
            inner: Arc::new(ConnectionInner {
                factory,
                pool,
                hooks,
                config,
                collector: ExceptionCollector::new(),
                closed: AtomicBool::new(false),
                state: AsyncMutex::new(Some(handle)),
            }),
        }
    }

    fn fire(&self, method: &str) {
        self.inner.hooks.fire_method_invocation(method);
    }

    /// Emits a `tracing` warning when a connection's checked-out lifetime
    /// exceeds `log_connection_longer_than` (spec §6). Stack capture for the
    /// event is handled by `tracing_subscriber`'s own span machinery, not by
    /// this crate, once `error-backtrace` attaches a backtrace to the
    /// taken-connection snapshot instead.
    #[allow(unused_variables)]
    fn log_long_connection(&self, elapsed: std::time::Duration) {
        if let Some(limit) = self.inner.config.logging.log_connection_longer_than {
            if elapsed > limit {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "connection held longer than log_connection_longer_than threshold"
                );
            }
        }
    }

    fn check_restriction(&self, sql: &str) -> Result<()> {
        match &self.inner.config.connection_restriction {
            Some(restriction) => restriction.check(sql),
            None => Ok(()),
        }
    }

    /// Records a driver error against this connection's collector (spec
    /// §4.5) — used by every descendant proxy when a driver call fails.
    pub(crate) fn record_error(&self, error: &error::Error) {
        self.inner.collector.add(error.clone());
    }

    pub(crate) fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    pub(crate) fn config(&self) -> &Arc<PoolConfig> {
        &self.inner.config
    }

    pub(crate) fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    /// `true` once `close`/`abort` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(error::ErrorKind::Closed.into());
        }
        Ok(())
    }

    /// Returns `false` if closed (spec §4.7.1, `isValid`); otherwise
    /// delegates to the driver's own liveness check within
    /// `validate_timeout`.
    pub async fn is_valid(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut guard = self.inner.state.lock().await;
        let Some(handle) = guard.as_mut() else {
            return false;
        };
        let query = self.inner.config.test_connection_query.as_deref();
        let check = self.inner.factory.validate(handle.raw_mut(), query);
        match self.inner.config.validate_timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, check).await, Ok(Ok(true))),
            None => matches!(check.await, Ok(true)),
        }
    }

    /// Creates an ad-hoc, uncached statement (spec §4.7.1,
    /// `createStatement`).
    pub async fn create_statement(&self) -> Result<StatementProxy<F>> {
        self.ensure_open()?;
        self.fire("createStatement");
        let mut guard = self.inner.state.lock().await;
        let handle = guard.as_mut().ok_or(error::ErrorKind::Closed)?;
        let raw = self.inner.factory.create_statement(handle.raw_mut()).await?;
        let holder = Arc::new(StatementHolder::new_uncached(raw, String::new()));
        Ok(StatementProxy::new(self.clone(), holder))
    }

    /// Prepares (or fetches from cache) a parameterized statement (spec
    /// §4.7.1, `prepareStatement`). The restriction check, if any, runs
    /// against `sql` before touching the cache or the driver.
    pub async fn prepare_statement(&self, sql: &str, args: Vec<Value>) -> Result<StatementProxy<F>> {
        self.prepare(MethodIdentity::PrepareStatement { arity: args.len() as u8 }, sql, args, "prepareStatement")
            .await
    }

    /// Prepares (or fetches from cache) a callable statement (spec §4.7.1,
    /// `prepareCall`).
    pub async fn prepare_call(&self, sql: &str, args: Vec<Value>) -> Result<StatementProxy<F>> {
        self.prepare(MethodIdentity::PrepareCall { arity: args.len() as u8 }, sql, args, "prepareCall")
            .await
    }

    async fn prepare(
        &self,
        method: MethodIdentity,
        sql: &str,
        args: Vec<Value>,
        hook_name: &str,
    ) -> Result<StatementProxy<F>> {
        self.ensure_open()?;
        self.check_restriction(sql)?;
        self.fire(hook_name);

        let mut guard = self.inner.state.lock().await;
        let handle = guard.as_mut().ok_or(error::ErrorKind::Closed)?;
        let connection_id: ConnectionId = handle.id;
        let key = StatementKey::new(connection_id, method, args.clone());
        let factory = self.inner.factory.clone();

        let (conn, cache) = handle.split_mut();
        let holder = cache
            .take(key, sql, || async move {
                match method {
                    MethodIdentity::PrepareStatement { .. } => {
                        factory.prepare_statement(conn, sql, &args).await
                    }
                    MethodIdentity::PrepareCall { .. } => factory.prepare_call(conn, sql, &args).await,
                }
            })
            .await?;

        Ok(StatementProxy::new(self.clone(), holder))
    }

    /// Wraps a metadata handle (spec §4.7.1, `getMetaData`).
    pub async fn get_metadata(&self) -> Result<MetadataProxy<F>> {
        self.ensure_open()?;
        self.fire("getMetaData");
        let mut guard = self.inner.state.lock().await;
        let handle = guard.as_mut().ok_or(error::ErrorKind::Closed)?;
        let raw = self.inner.factory.metadata(handle.raw_mut()).await?;
        Ok(MetadataProxy::new(self.clone(), raw))
    }

    /// Returns `holder` to this connection's statement cache (spec §4.4's
    /// `restore`), or, if the connection has already been closed/severed out
    /// from under the statement (its raw connection — and with it every
    /// cached raw statement — already destroyed via `remove_all`), does
    /// nothing.
    pub(crate) async fn cache_restore(&self, holder: Arc<StatementHolder<F::Statement>>) {
        let mut guard = self.inner.state.lock().await;
        if let Some(handle) = guard.as_mut() {
            handle.cache.restore(holder).await;
        }
    }

    /// Removes `key` from this connection's statement cache, closing its
    /// raw statement (spec §4.4's `remove`; used by `StatementProxy::cancel`).
    pub(crate) async fn cache_remove(&self, key: &StatementKey) {
        let mut guard = self.inner.state.lock().await;
        if let Some(handle) = guard.as_mut() {
            handle.cache.remove(key).await;
        }
    }

    /// Clears SQL warnings on the underlying connection, honoring
    /// `clear_sql_warnings` (spec §6). Exposed so `StatementProxy::close`
    /// can invoke it as part of the restore-time protocol (spec §4.4's
    /// `restore(holder, clearWarnings)`).
    pub(crate) async fn clear_warnings(&self) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let handle = guard.as_mut().ok_or(error::ErrorKind::Closed)?;
        self.inner.factory.clear_warnings(handle.raw_mut()).await
    }

    /// Idempotent (spec §4.7.1): on the first call, returns the underlying
    /// handle to the pool with validity decided by whether any non-transient
    /// error was recorded against this connection's
    /// [`crate::collector::ExceptionCollector`]. Every call after the first
    /// is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.close_internal(false).await
    }

    /// Like [`ConnectionProxy::close`], but also forwards an `abort` to the
    /// raw connection before returning it to the pool (spec §4.7.1:
    /// "`abort` also forwards to the raw `abort`").
    pub async fn abort(&self) -> Result<()> {
        self.close_internal(true).await
    }

    async fn close_internal(&self, is_abort: bool) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.inner.state.lock().await;
        let Some(mut handle) = guard.take() else {
            return Ok(());
        };
        if is_abort {
            let _ = self.inner.factory.abort(handle.raw_mut()).await;
        }
        self.log_long_connection(handle.created_at.elapsed());

        if !handle.is_pooled() {
            // A `getNonPooled()` handle was never counted by the pool's
            // `created`/`available` bookkeeping, so closing it just destroys
            // it directly rather than feeding it back through `restore`.
            handle.cache.remove_all().await;
            if let Some(raw) = handle.take_raw() {
                self.inner.factory.destroy(raw).await;
            }
            return Ok(());
        }
        let valid = self.inner.collector.is_empty();
        self.inner.hooks.fire_on_restore().await;
        self.inner.pool.restore(handle, valid).await;
        Ok(())
    }

    /// Destroys the underlying connection immediately, bypassing the normal
    /// `close`/restore flow (spec §4.2, `sever`; exposed on the facade as
    /// `DataSource::sever_connection`).
    pub(crate) async fn sever(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut guard = self.inner.state.lock().await;
        let Some(mut handle) = guard.take() else {
            return Ok(());
        };
        let id = handle.id;
        let is_pooled = handle.is_pooled();
        handle.cache.remove_all().await;
        if let Some(raw) = handle.take_raw() {
            self.inner.factory.destroy(raw).await;
        }
        if !is_pooled {
            // Never counted by the pool's bookkeeping; nothing to notify.
            return Ok(());
        }
        self.inner.pool.notify_severed(id).await;
        Ok(())
    }
}
