//! The facade tying every other module together (spec §4.8): owns
//! configuration, the hook registry, the pool, and the `NEW -> WORKING ->
//! TERMINATED` lifecycle. Generalized from the way the teacher driver's
//! `Client` sits on top of `cmap`/`sdam`/`options` without itself knowing how
//! any of them work internally — `DataSource` is pure wiring, not logic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ConnectionId;
use crate::config::{PoolConfig, Restriction};
use crate::driver::RawConnectionFactory;
use crate::error::{self, Result};
use crate::hooks::{
    HookRegistry, HookRegistryBuilder, LifecycleHook, MethodInvocationHook, ResultSetRetrievalHook,
    StatementExecutionHook,
};
use crate::pool::{ObjectPool, PooledHandle, Provenance, TakenSnapshot};
use crate::proxy::ConnectionProxy;

const STATE_NEW: u8 = 0;
const STATE_WORKING: u8 = 1;
const STATE_TERMINATED: u8 = 2;

/// Atomic-backed copies of the logging thresholds (spec §6: "dynamic setters
/// for the listed thresholds"), distinct from the frozen `HookRegistry`
/// lists which never change after `start()`. `Duration`s are stored as
/// milliseconds in an `AtomicI64`, `-1` standing in for `None` — there is no
/// `AtomicOption<Duration>` in the standard library, and this crate's
/// thresholds are always non-negative, so the sentinel is unambiguous.
struct DynamicThresholds {
    log_connection_longer_than_ms: AtomicI64,
    log_stack_trace_for_long_connection: AtomicBool,
    log_query_execution_longer_than_ms: AtomicI64,
    log_stack_trace_for_long_query_execution: AtomicBool,
    log_large_result_set: AtomicI64,
    log_stack_trace_for_large_result_set: AtomicBool,
    log_taken_connections_on_timeout: AtomicBool,
}

fn duration_to_ms(d: Option<Duration>) -> i64 {
    d.map(|d| d.as_millis() as i64).unwrap_or(-1)
}

fn ms_to_duration(ms: i64) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

impl DynamicThresholds {
    fn from_config(logging: &crate::config::LoggingThresholds) -> Self {
        DynamicThresholds {
            log_connection_longer_than_ms: AtomicI64::new(duration_to_ms(logging.log_connection_longer_than)),
            log_stack_trace_for_long_connection: AtomicBool::new(logging.log_stack_trace_for_long_connection),
            log_query_execution_longer_than_ms: AtomicI64::new(duration_to_ms(
                logging.log_query_execution_longer_than,
            )),
            log_stack_trace_for_long_query_execution: AtomicBool::new(
                logging.log_stack_trace_for_long_query_execution,
            ),
            log_large_result_set: AtomicI64::new(
                logging.log_large_result_set.map(|v| v as i64).unwrap_or(-1),
            ),
            log_stack_trace_for_large_result_set: AtomicBool::new(logging.log_stack_trace_for_large_result_set),
            log_taken_connections_on_timeout: AtomicBool::new(logging.log_taken_connections_on_timeout),
        }
    }
}

/// The components built at `start()` and torn down at `close()`.
struct Working<F: RawConnectionFactory> {
    factory: Arc<F>,
    pool: ObjectPool<F>,
    hooks: Arc<HookRegistry>,
    config: Arc<PoolConfig>,
}

/// A formatted, newest-first dump of every currently-issued handle (spec §6,
/// `showTakenConnections()`).
pub struct TakenConnectionsReport {
    pub entries: Vec<TakenSnapshot>,
}

impl std::fmt::Display for TakenConnectionsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "(no taken connections)");
        }
        for entry in &self.entries {
            writeln!(
                f,
                "connection {} taken_at={:?} last_access_at={:?}{}",
                entry.connection_id,
                entry.taken_at,
                entry.last_access_at,
                if entry.stack.is_some() { " (stack captured)" } else { "" },
            )?;
            if let Some(stack) = &entry.stack {
                writeln!(f, "{stack}")?;
            }
        }
        Ok(())
    }
}

/// Builds up the frozen hook sequences before `start()`. Obtained from
/// [`DataSource::hooks`] while the facade is still `NEW`; every `add_*` call
/// after `start()` has run is silently ignored, the same way the teacher
/// driver treats a `ClientOptions` mutation after the `Client` has already
/// connected.
pub struct HooksBuilder<'a> {
    builder: &'a SyncMutex<Option<HookRegistryBuilder>>,
}

impl<'a> HooksBuilder<'a> {
    pub fn add_method_invocation_hook(&self, hook: MethodInvocationHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_method_invocation_hook(hook);
        }
        self
    }

    pub fn add_statement_execution_hook(&self, hook: Arc<dyn StatementExecutionHook>) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_statement_execution_hook(hook);
        }
        self
    }

    pub fn add_result_set_retrieval_hook(&self, hook: ResultSetRetrievalHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_result_set_retrieval_hook(hook);
        }
        self
    }

    pub fn add_on_init(&self, hook: LifecycleHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_on_init(hook);
        }
        self
    }

    pub fn add_on_get(&self, hook: LifecycleHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_on_get(hook);
        }
        self
    }

    pub fn add_on_restore(&self, hook: LifecycleHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_on_restore(hook);
        }
        self
    }

    pub fn add_on_destroy(&self, hook: LifecycleHook) -> &Self {
        if let Some(b) = self.builder.lock().as_mut() {
            b.add_on_destroy(hook);
        }
        self
    }
}

/// The pooled-resource manager facade (spec §1, §4.8): the single type an
/// embedder constructs, configures, starts, and eventually closes.
/// `Send + Sync`; every method may be called concurrently from any number of
/// caller tasks, matching spec §5's "parallel threads" scheduling model.
pub struct DataSource<F: RawConnectionFactory> {
    raw_factory: Arc<F>,
    config: Arc<PoolConfig>,
    hook_builder: SyncMutex<Option<HookRegistryBuilder>>,
    state: AtomicU8,
    working: SyncMutex<Option<Working<F>>>,
    thresholds: DynamicThresholds,
    non_pooled_ids: AtomicU64,
}

impl<F: RawConnectionFactory> DataSource<F> {
    /// Constructs a `DataSource` in the `NEW` state. Nothing is connected or
    /// spawned yet; call [`DataSource::hooks`] to register lifecycle/
    /// execution hooks, then [`DataSource::start`].
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let thresholds = DynamicThresholds::from_config(&config.logging);
        DataSource {
            raw_factory: Arc::new(factory),
            config: Arc::new(config),
            hook_builder: SyncMutex::new(Some(HookRegistryBuilder::new())),
            state: AtomicU8::new(STATE_NEW),
            working: SyncMutex::new(None),
            thresholds,
            non_pooled_ids: AtomicU64::new(0),
        }
    }

    /// Exposes the hook registration surface. A no-op builder once `start()`
    /// has run.
    pub fn hooks(&self) -> HooksBuilder<'_> {
        HooksBuilder {
            builder: &self.hook_builder,
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    /// Validates configuration, builds the pool, the statement cache
    /// factory, and the frozen hook registry, and transitions `NEW ->
    /// WORKING` (spec §4.8). Returns `ErrorKind::Config` without mutating
    /// state if validation fails. Calling `start()` more than once is a
    /// programmer error signaled the same way: the second call observes the
    /// facade already out of `NEW` and returns `ErrorKind::Config`.
    pub fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_NEW, STATE_WORKING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(error::config("DataSource::start called more than once"));
        }
        self.config.validate()?;

        let builder = self
            .hook_builder
            .lock()
            .take()
            .expect("hook_builder is only taken once, guarded by the state CAS above");
        let hooks = Arc::new(builder.build());

        let pool = ObjectPool::new(self.raw_factory.clone(), self.config.clone(), hooks.clone());

        *self.working.lock() = Some(Working {
            factory: self.raw_factory.clone(),
            pool,
            hooks,
            config: self.config.clone(),
        });
        Ok(())
    }

    fn with_working<T>(&self, f: impl FnOnce(&Working<F>) -> T) -> Result<T> {
        match self.state() {
            STATE_NEW => Err(error::config("DataSource has not been started")),
            STATE_TERMINATED => Err(error::ErrorKind::PoolClosed.into()),
            _ => Ok(self.with_working_any_state(f)),
        }
    }

    /// Like [`DataSource::with_working`], but also runs on a `TERMINATED`
    /// facade — the `Working` value is built once at `start()` and never
    /// cleared by `close()`, since its channels degrade gracefully into
    /// silently-dropped sends once the worker task has exited. Used only by
    /// [`DataSource::get_non_pooled`]'s `allow_connection_after_termination`
    /// path, which needs a hook registry and a (dead) pool handle to
    /// construct a `ConnectionProxy` even after termination.
    fn with_working_any_state<T>(&self, f: impl FnOnce(&Working<F>) -> T) -> T {
        let guard = self.working.lock();
        let working = guard
            .as_ref()
            .expect("NEW is excluded by callers; start() always populates working");
        f(working)
    }

    /// Checks out a connection from the pool (spec §4.7.1/§4.8, `get()`).
    /// Fires the `OnGet` lifecycle hook sequence once the handle is in hand.
    pub async fn get(&self) -> Result<ConnectionProxy<F>> {
        let (factory, pool, hooks, config) = self.with_working(|w| {
            (w.factory.clone(), w.pool.clone(), w.hooks.clone(), w.config.clone())
        })?;
        let handle = pool.take().await?;
        hooks.fire_on_get().await;
        Ok(ConnectionProxy::new(handle, factory, pool, hooks, config))
    }

    /// Like [`DataSource::get`], but additionally installs `restriction` as
    /// this connection's query-text restriction, overriding (for this handle
    /// only) whatever `connection_restriction` is configured globally (spec
    /// §6, "a restricted variant `get(restriction)`").
    pub async fn get_restricted(&self, restriction: Restriction) -> Result<ConnectionProxy<F>> {
        let (factory, pool, hooks, mut config) = self.with_working(|w| {
            (
                w.factory.clone(),
                w.pool.clone(),
                w.hooks.clone(),
                (*w.config).clone(),
            )
        })?;
        config.connection_restriction = Some(restriction);
        let handle = pool.take().await?;
        hooks.fire_on_get().await;
        Ok(ConnectionProxy::new(handle, factory, pool, hooks, Arc::new(config)))
    }

    /// Like [`DataSource::get`], but fails promptly with
    /// `ErrorKind::Interrupted` if `cancel` fires before a handle becomes
    /// available, instead of blocking indefinitely (spec.md:172).
    pub async fn get_cancellable(&self, cancel: CancellationToken) -> Result<ConnectionProxy<F>> {
        let (factory, pool, hooks, config) = self.with_working(|w| {
            (w.factory.clone(), w.pool.clone(), w.hooks.clone(), w.config.clone())
        })?;
        let handle = pool.take_cancellable(&cancel).await?;
        hooks.fire_on_get().await;
        Ok(ConnectionProxy::new(handle, factory, pool, hooks, config))
    }

    /// Like [`DataSource::get`], but fails with `ErrorKind::Timeout` instead
    /// of blocking indefinitely (spec §4.2, `tryTake`). Attaches a
    /// taken-connections snapshot to the error when
    /// `log_taken_connections_on_timeout` is enabled.
    pub async fn try_get(&self, timeout: Duration) -> Result<ConnectionProxy<F>> {
        let (factory, pool, hooks, config) = self.with_working(|w| {
            (w.factory.clone(), w.pool.clone(), w.hooks.clone(), w.config.clone())
        })?;
        let handle = match pool.try_take(timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                if self.thresholds.log_taken_connections_on_timeout.load(Ordering::SeqCst) {
                    if matches!(e.kind.as_ref(), error::ErrorKind::Timeout { .. }) {
                        let taken = pool.taken_snapshots().await;
                        return Err(error::timeout_with_snapshot(Some(taken)));
                    }
                }
                return Err(e);
            }
        };
        hooks.fire_on_get().await;
        Ok(ConnectionProxy::new(handle, factory, pool, hooks, config))
    }

    /// Produces a raw, unpooled connection (spec §6, `getNonPooled()`):
    /// calls [`RawConnectionFactory::create`] directly and never touches the
    /// pool's `created`/`available` counters. Legal in `WORKING`, and in
    /// `TERMINATED` when `allow_connection_after_termination` is configured
    /// (spec §4.8).
    pub async fn get_non_pooled(&self) -> Result<ConnectionProxy<F>> {
        let state = self.state();
        if state == STATE_NEW {
            return Err(error::config("DataSource has not been started"));
        }
        if state == STATE_TERMINATED && !self.config.allow_connection_after_termination {
            return Err(error::ErrorKind::PoolClosed.into());
        }

        let raw = self.raw_factory.create().await?;
        let id = ConnectionId(u64::MAX - self.non_pooled_ids.fetch_add(1, Ordering::SeqCst));
        let handle = PooledHandle::new(
            id,
            raw,
            self.raw_factory.clone(),
            self.config.cache.max_size,
            0,
            Provenance::NonPooled,
        );

        // `working` is populated at `start()` and never cleared by `close()`
        // (its channels degrade into silently-dropped sends once the pool's
        // worker task has exited), so this reads cleanly in both WORKING and
        // TERMINATED. `ConnectionProxy::close`/`sever` never actually call
        // into `pool` for a `Provenance::NonPooled` handle like this one.
        let (pool, hooks, config) =
            self.with_working_any_state(|w| (w.pool.clone(), w.hooks.clone(), w.config.clone()));
        hooks.fire_on_init().await;
        hooks.fire_on_get().await;
        Ok(ConnectionProxy::new(handle, self.raw_factory.clone(), pool, hooks, config))
    }

    /// Destroys `proxy`'s underlying connection immediately, bypassing the
    /// normal close/restore flow (spec §6, `severConnection(proxy)`).
    pub async fn sever_connection(&self, proxy: &ConnectionProxy<F>) -> Result<()> {
        proxy.sever().await
    }

    /// The number of live handles currently issued to callers.
    pub async fn taken(&self) -> Result<u32> {
        let pool = self.with_working(|w| w.pool.clone())?;
        Ok(pool.taken().await)
    }

    /// The number of live handles not currently issued.
    pub async fn remaining_created(&self) -> Result<u32> {
        let pool = self.with_working(|w| w.pool.clone())?;
        Ok(pool.remaining_created().await)
    }

    /// The running total of handles ever created by this pool.
    pub async fn created_total(&self) -> Result<u64> {
        let pool = self.with_working(|w| w.pool.clone())?;
        Ok(pool.created_total().await)
    }

    /// The configured floor (spec §6, `poolInitialSize`).
    pub fn pool_initial_size(&self) -> u32 {
        self.config.pool_initial_size
    }

    /// The configured ceiling (spec §6, `poolMaxSize`).
    pub fn pool_max_size(&self) -> u32 {
        self.config.pool_max_size
    }

    /// A formatted, newest-first dump of every currently-issued handle (spec
    /// §6, `showTakenConnections()`). Only meaningful when
    /// `pool_enable_connection_tracking` is set; otherwise always empty.
    pub async fn show_taken_connections(&self) -> Result<TakenConnectionsReport> {
        let pool = self.with_working(|w| w.pool.clone())?;
        let mut entries = pool.taken_snapshots().await;
        entries.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(TakenConnectionsReport { entries })
    }

    pub fn log_connection_longer_than(&self) -> Option<Duration> {
        ms_to_duration(self.thresholds.log_connection_longer_than_ms.load(Ordering::SeqCst))
    }

    pub fn set_log_connection_longer_than(&self, value: Option<Duration>) {
        self.thresholds
            .log_connection_longer_than_ms
            .store(duration_to_ms(value), Ordering::SeqCst);
    }

    pub fn log_query_execution_longer_than(&self) -> Option<Duration> {
        ms_to_duration(self.thresholds.log_query_execution_longer_than_ms.load(Ordering::SeqCst))
    }

    pub fn set_log_query_execution_longer_than(&self, value: Option<Duration>) {
        self.thresholds
            .log_query_execution_longer_than_ms
            .store(duration_to_ms(value), Ordering::SeqCst);
    }

    pub fn log_stack_trace_for_long_connection(&self) -> bool {
        self.thresholds.log_stack_trace_for_long_connection.load(Ordering::SeqCst)
    }

    pub fn set_log_stack_trace_for_long_connection(&self, value: bool) {
        self.thresholds.log_stack_trace_for_long_connection.store(value, Ordering::SeqCst);
    }

    pub fn log_stack_trace_for_long_query_execution(&self) -> bool {
        self.thresholds.log_stack_trace_for_long_query_execution.load(Ordering::SeqCst)
    }

    pub fn set_log_stack_trace_for_long_query_execution(&self, value: bool) {
        self.thresholds
            .log_stack_trace_for_long_query_execution
            .store(value, Ordering::SeqCst);
    }

    pub fn log_large_result_set(&self) -> Option<u64> {
        let v = self.thresholds.log_large_result_set.load(Ordering::SeqCst);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn set_log_large_result_set(&self, value: Option<u64>) {
        self.thresholds
            .log_large_result_set
            .store(value.map(|v| v as i64).unwrap_or(-1), Ordering::SeqCst);
    }

    pub fn log_stack_trace_for_large_result_set(&self) -> bool {
        self.thresholds.log_stack_trace_for_large_result_set.load(Ordering::SeqCst)
    }

    pub fn set_log_stack_trace_for_large_result_set(&self, value: bool) {
        self.thresholds
            .log_stack_trace_for_large_result_set
            .store(value, Ordering::SeqCst);
    }

    pub fn log_taken_connections_on_timeout(&self) -> bool {
        self.thresholds.log_taken_connections_on_timeout.load(Ordering::SeqCst)
    }

    pub fn set_log_taken_connections_on_timeout(&self, value: bool) {
        self.thresholds.log_taken_connections_on_timeout.store(value, Ordering::SeqCst);
    }

    /// Idempotent (spec §4.8): transitions to `TERMINATED`, stops the
    /// reducer, and terminates the pool, destroying every currently-
    /// available handle. Outstanding (taken) handles are destroyed as they
    /// are individually restored or severed, never forcibly reclaimed (spec
    /// §5).
    pub async fn close(&self) {
        if self
            .state
            .compare_exchange(STATE_WORKING, STATE_TERMINATED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Already NEW (nothing to close) or already TERMINATED.
            self.state.store(STATE_TERMINATED, Ordering::SeqCst);
            return;
        }
        // `working` is deliberately left in place (see
        // `with_working_any_state`) rather than taken out here.
        let pool = self.working.lock().as_ref().map(|w| w.pool.clone());
        if let Some(pool) = pool {
            pool.terminate().await;
        }
    }
}
