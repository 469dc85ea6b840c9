//! The statement-level proxy (spec §4.7.2): wraps either a cached or an
//! uncached [`crate::cache::StatementHolder`] and enforces the "close means
//! restore-to-cache, not destroy" translation the same way
//! [`super::connection::ConnectionProxy`] does for the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;

use crate::cache::StatementHolder;
use crate::driver::RawConnectionFactory;
use crate::error::{self, Result};
use crate::hooks::ExecutionContext;
use crate::value::Value;

use super::connection::ConnectionProxy;
use super::result_set::ResultSetProxy;

struct StatementInner<F: RawConnectionFactory> {
    connection: ConnectionProxy<F>,
    holder: Arc<StatementHolder<F::Statement>>,
    closed: AtomicBool,
    last_result_set: SyncMutex<Option<ResultSetProxy<F>>>,
    param_log: SyncMutex<Vec<(String, String)>>,
    batch: SyncMutex<Vec<String>>,
}

/// A virtual prepared/callable/ad-hoc statement handle. `Clone` is an `Arc`
/// clone sharing the same underlying holder, so a
/// [`super::result_set::ResultSetProxy`] produced from it can hold a
/// reference back to answer `getStatement`-style queries and to report
/// closure of its last result set at the statement's own `close`.
pub struct StatementProxy<F: RawConnectionFactory> {
    inner: Arc<StatementInner<F>>,
}

impl<F: RawConnectionFactory> Clone for StatementProxy<F> {
    fn clone(&self) -> Self {
        StatementProxy {
            inner: self.inner.clone(),
        }
    }
}

impl<F: RawConnectionFactory> StatementProxy<F> {
    pub(crate) fn new(connection: ConnectionProxy<F>, holder: Arc<StatementHolder<F::Statement>>) -> Self {
        StatementProxy {
            inner: Arc::new(StatementInner {
                connection,
                holder,
                closed: AtomicBool::new(false),
                last_result_set: SyncMutex::new(None),
                param_log: SyncMutex::new(Vec::new()),
                batch: SyncMutex::new(Vec::new()),
            }),
        }
    }

    /// The SQL text this statement was prepared with (empty for a
    /// `createStatement`-produced ad-hoc statement, which carries no fixed
    /// text until an `execute*` call supplies one).
    pub fn sql_text(&self) -> &str {
        &self.inner.holder.sql_text
    }

    /// Whether this holder participates in the statement cache's lifecycle
    /// protocol at all (spec §3's "uncached holder").
    pub fn is_cached(&self) -> bool {
        self.inner.holder.is_cached()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns the connection this statement was created from (spec §4.7.1:
    /// "must return the current connection proxy").
    pub fn get_connection(&self) -> ConnectionProxy<F> {
        self.inner.connection.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(error::ErrorKind::Closed.into());
        }
        Ok(())
    }

    fn record_param(&self, setter: &str, args: &[Value]) {
        if self.inner.connection.config().logging.include_query_parameters {
            let rendered = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            self.inner.param_log.lock().push((setter.to_string(), rendered));
        }
    }

    /// Forwards a bound-parameter setter call (spec §4.7.2, `set*`).
    /// Recorded into the parameter log only when
    /// `include_query_parameters` is enabled.
    pub fn set_parameter(&self, setter_name: &str, args: &[Value]) -> Result<()> {
        self.ensure_open()?;
        self.record_param(setter_name, args);
        Ok(())
    }

    /// A snapshot of every recorded `set*` call, in call order. Empty
    /// unless `include_query_parameters` is enabled.
    pub fn recorded_parameters(&self) -> Vec<(String, String)> {
        self.inner.param_log.lock().clone()
    }

    /// Runs `sql` through the connection's statement-execution hook onion,
    /// then the real query, returning the produced result set wrapped in a
    /// [`ResultSetProxy`] (spec §4.7.2, `execute*`/`executeQuery`).
    pub async fn execute_query(&self, sql: &str, args: &[Value]) -> Result<ResultSetProxy<F>> {
        self.ensure_open()?;
        self.check_restriction(sql)?;
        self.inner.connection.hooks().fire_method_invocation("executeQuery");

        let connection = self.inner.connection.clone();
        let holder = self.inner.holder.clone();
        let ctx = ExecutionContext { sql, params: args };
        let started = std::time::Instant::now();

        let result_set_slot: SyncMutex<Option<Result<F::ResultSet>>> = SyncMutex::new(None);
        let outcome = self
            .inner
            .connection
            .hooks()
            .fire_statement_execution(&ctx, || {
                let holder = holder.clone();
                let connection = connection.clone();
                Box::pin(async move {
                    let mut raw = holder.take_raw().ok_or_else(|| {
                        error::internal("statement raw handle unavailable for execute")
                    })?;
                    let result = connection.factory().execute_query(&mut raw, sql, args).await;
                    holder.put_raw(raw);
                    match result {
                        Ok(rs) => {
                            *result_set_slot.lock() = Some(Ok(rs));
                            Ok(())
                        }
                        Err(e) => {
                            connection.record_error(&e);
                            *result_set_slot.lock() = Some(Err(e.clone()));
                            Err(e)
                        }
                    }
                })
            })
            .await;

        self.log_long_query(sql, started.elapsed());
        outcome?;
        let raw_result_set = result_set_slot
            .into_inner()
            .expect("hook onion always runs the terminal link")?;

        let proxy = ResultSetProxy::new(
            self.clone(),
            raw_result_set,
            sql.to_string(),
            args.to_vec(),
        );
        *self.inner.last_result_set.lock() = Some(proxy.clone());
        Ok(proxy)
    }

    /// Runs `sql` through the hook onion and the real update, returning the
    /// affected-row count (spec §4.7.2, `executeUpdate`).
    pub async fn execute_update(&self, sql: &str, args: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.check_restriction(sql)?;
        self.inner.connection.hooks().fire_method_invocation("executeUpdate");

        let connection = self.inner.connection.clone();
        let holder = self.inner.holder.clone();
        let ctx = ExecutionContext { sql, params: args };
        let started = std::time::Instant::now();

        let count_slot: SyncMutex<Option<Result<u64>>> = SyncMutex::new(None);
        let outcome = self
            .inner
            .connection
            .hooks()
            .fire_statement_execution(&ctx, || {
                let holder = holder.clone();
                let connection = connection.clone();
                Box::pin(async move {
                    let mut raw = holder.take_raw().ok_or_else(|| {
                        error::internal("statement raw handle unavailable for execute")
                    })?;
                    let result = connection.factory().execute_update(&mut raw, sql, args).await;
                    holder.put_raw(raw);
                    match result {
                        Ok(n) => {
                            *count_slot.lock() = Some(Ok(n));
                            Ok(())
                        }
                        Err(e) => {
                            connection.record_error(&e);
                            *count_slot.lock() = Some(Err(e.clone()));
                            Err(e)
                        }
                    }
                })
            })
            .await;

        self.log_long_query(sql, started.elapsed());
        outcome?;
        count_slot.into_inner().expect("hook onion always runs the terminal link")
    }

    /// Appends `sql` to this statement's batch (spec §4.7.4's restriction
    /// check applies here too: `addBatch` is one of the statement-text-
    /// accepting methods).
    pub fn add_batch(&self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        self.check_restriction(sql)?;
        self.inner.batch.lock().push(sql.to_string());
        Ok(())
    }

    /// Executes every batched statement in submission order, returning each
    /// one's affected-row count, and clears the batch.
    pub async fn execute_batch(&self) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let batch = std::mem::take(&mut *self.inner.batch.lock());
        let mut counts = Vec::with_capacity(batch.len());
        for sql in batch {
            counts.push(self.execute_update(&sql, &[]).await?);
        }
        Ok(counts)
    }

    fn check_restriction(&self, sql: &str) -> Result<()> {
        match &self.inner.connection.config().connection_restriction {
            Some(restriction) => restriction.check(sql),
            None => Ok(()),
        }
    }

    /// Emits a `tracing` warning when a single `execute*` call runs longer
    /// than `log_query_execution_longer_than` (spec §6).
    #[allow(unused_variables)]
    fn log_long_query(&self, sql: &str, elapsed: std::time::Duration) {
        if let Some(limit) = self.inner.connection.config().logging.log_query_execution_longer_than {
            if elapsed > limit {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    sql,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query execution exceeded log_query_execution_longer_than threshold"
                );
            }
        }
    }

    /// Cancels this statement (spec §4.7.2, `cancel`): removes it from the
    /// cache (a cancelled statement is no longer safe to reuse) and forwards
    /// the cancellation to the raw statement.
    pub async fn cancel(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.connection.hooks().fire_method_invocation("cancel");
        if let Some(key) = &self.inner.holder.key {
            self.inner.connection.cache_remove(key).await;
        }
        if let Some(mut raw) = self.inner.holder.take_raw() {
            let result = self.inner.connection.factory().cancel_statement(&mut raw).await;
            self.inner.holder.put_raw(raw);
            result?;
        }
        Ok(())
    }

    /// Retrieves the keys generated by this statement's last execution
    /// (spec §4.7.2, `getGeneratedKeys`), wrapped in a [`ResultSetProxy`]
    /// tied to this statement.
    pub async fn get_generated_keys(&self) -> Result<ResultSetProxy<F>> {
        self.ensure_open()?;
        self.inner.connection.hooks().fire_method_invocation("getGeneratedKeys");
        let mut raw = self
            .inner
            .holder
            .take_raw()
            .ok_or_else(|| error::internal("statement raw handle unavailable"))?;
        let result = self.inner.connection.factory().generated_keys(&mut raw).await;
        self.inner.holder.put_raw(raw);
        let rs = result?;
        let proxy = ResultSetProxy::new(self.clone(), rs, self.sql_text().to_string(), Vec::new());
        *self.inner.last_result_set.lock() = Some(proxy.clone());
        Ok(proxy)
    }

    /// Idempotent (spec §4.7.2): closes the last tracked result set, then
    /// either restores this holder to the cache or — for an uncached
    /// holder, or one evicted out from under it — closes the raw statement
    /// directly. Both outcomes are handled uniformly by
    /// [`crate::cache::StatementCache::restore`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(rs) = self.inner.last_result_set.lock().take() {
            rs.close().await?;
        }
        if self.inner.connection.config().clear_sql_warnings {
            if let Err(e) = self.inner.connection.clear_warnings().await {
                // Open question (spec §9) resolved in DESIGN.md: a failed
                // clearWarnings only evicts this cache entry, it does not
                // invalidate the whole connection.
                if let Some(key) = &self.inner.holder.key {
                    self.inner.connection.cache_remove(key).await;
                }
                return Err(e);
            }
        }
        self.inner.connection.cache_restore(self.inner.holder.clone()).await;
        Ok(())
    }
}
