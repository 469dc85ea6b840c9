//! The result-set proxy (spec §4.7.3): tracks row traversal timing and row
//! count, and fires the `ResultSetRetrieval` hook exactly once, at close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::driver::RawConnectionFactory;
use crate::error::{self, Result};
use crate::value::Value;

use super::connection::ConnectionProxy;
use super::statement::StatementProxy;

struct ResultSetInner<F: RawConnectionFactory> {
    statement: StatementProxy<F>,
    raw: AsyncMutex<Option<F::ResultSet>>,
    sql: String,
    params: Vec<Value>,
    row_count: AtomicU64,
    first_row_at: SyncMutex<Option<Instant>>,
    last_row_at: SyncMutex<Option<Instant>>,
    closed: AtomicBool,
}

/// A virtual result-set handle, lifetime-bounded by its owning
/// [`StatementProxy`] (spec §3: "Lifecycle bounded by parent statement
/// proxy's lifetime"). `Clone` shares the same underlying state, which is
/// what lets a statement's own `close` reach in and close the caller's
/// still-open result set.
pub struct ResultSetProxy<F: RawConnectionFactory> {
    inner: Arc<ResultSetInner<F>>,
}

impl<F: RawConnectionFactory> Clone for ResultSetProxy<F> {
    fn clone(&self) -> Self {
        ResultSetProxy {
            inner: self.inner.clone(),
        }
    }
}

impl<F: RawConnectionFactory> ResultSetProxy<F> {
    pub(crate) fn new(statement: StatementProxy<F>, raw: F::ResultSet, sql: String, params: Vec<Value>) -> Self {
        ResultSetProxy {
            inner: Arc::new(ResultSetInner {
                statement,
                raw: AsyncMutex::new(Some(raw)),
                sql,
                params,
                row_count: AtomicU64::new(0),
                first_row_at: SyncMutex::new(None),
                last_row_at: SyncMutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The number of rows observed via [`ResultSetProxy::next`] so far.
    pub fn row_count(&self) -> u64 {
        self.inner.row_count.load(Ordering::SeqCst)
    }

    /// Returns the connection this result set's statement belongs to (spec
    /// §4.7.1: every descendant must answer `getConnection` with the live
    /// connection proxy, not the raw connection).
    pub fn get_connection(&self) -> ConnectionProxy<F> {
        self.inner.statement.get_connection()
    }

    /// Returns the statement this result set was produced from.
    pub fn get_statement(&self) -> StatementProxy<F> {
        self.inner.statement.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(error::ErrorKind::Closed.into());
        }
        Ok(())
    }

    /// Advances to the next row, returning `false` once exhausted (spec
    /// §4.7.3). Records the first/last-row timestamps used to compute the
    /// elapsed time reported to the `ResultSetRetrieval` hook at close.
    pub async fn next(&self) -> Result<bool> {
        self.ensure_open()?;
        self.get_connection().hooks().fire_method_invocation("next");

        let mut guard = self.inner.raw.lock().await;
        let raw = guard.as_mut().ok_or(error::ErrorKind::Closed)?;
        let has_row = self
            .inner
            .statement
            .get_connection()
            .factory()
            .result_set_next(raw)
            .await?;

        if has_row {
            let now = Instant::now();
            let mut first = self.inner.first_row_at.lock();
            if first.is_none() {
                *first = Some(now);
            }
            *self.inner.last_row_at.lock() = Some(now);
            self.inner.row_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(has_row)
    }

    /// Idempotent: on the first call, fires the `ResultSetRetrieval` hook
    /// with the originating SQL, bound parameters, row count, and elapsed
    /// time between the first and last row observed, then forwards the
    /// real close to the driver (spec §4.7.3).
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let elapsed = match (*self.inner.first_row_at.lock(), *self.inner.last_row_at.lock()) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };
        let row_count = self.row_count();
        let connection = self.get_connection();
        connection
            .hooks()
            .fire_result_set_retrieval(&self.inner.sql, &self.inner.params, row_count, elapsed);

        if let Some(limit) = connection.config().logging.log_large_result_set {
            if row_count > limit {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    sql = %self.inner.sql,
                    row_count,
                    "result set exceeded log_large_result_set threshold"
                );
            }
        }

        let mut guard = self.inner.raw.lock().await;
        if let Some(raw) = guard.take() {
            connection.factory().close_result_set(raw).await;
        }
        Ok(())
    }
}
