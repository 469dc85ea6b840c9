//! The collaborator interfaces an embedder implements to plug a concrete
//! wire protocol into the pool. Spec §1 scopes the physical wire protocol
//! out of this crate entirely ("abstracted by `RawConnectionFactory`"); this
//! module is that abstraction boundary, generalized from the teacher
//! driver's `cmap::establish::ConnectionEstablisher` (which opens, hand-
//! shakes, and authenticates a single MongoDB wire connection) into a
//! driver-agnostic trait.
//!
//! A concrete implementation — the JDBC-flavored driver the spec is modeled
//! on, a Postgres wire driver, an in-memory test double — supplies
//! `Connection`, `Statement`, `ResultSet`, and `Metadata` associated types
//! and the operations to create and tear each of them down.

use async_trait::async_trait;

use crate::{error::Result, value::Value};

/// Opens, validates, and destroys raw connections, and operates on whatever
/// derived artifacts (statements, result sets, metadata handles) a
/// particular driver produces from them. Spec §4.1.
#[async_trait]
pub trait RawConnectionFactory: Send + Sync + 'static {
    /// The opaque, driver-owned connection handle. Exactly one
    /// [`crate::pool::PooledHandle`] owns a given `Connection` at a time.
    type Connection: Send + 'static;

    /// The opaque, driver-owned prepared/callable statement handle.
    type Statement: Send + 'static;

    /// The opaque, driver-owned result-set handle.
    type ResultSet: Send + 'static;

    /// The opaque, driver-owned metadata handle.
    type Metadata: Send + 'static;

    /// Opens a new connection, applying default auto-commit / read-only /
    /// isolation / catalog and running any configured initialization SQL.
    /// Retried by [`crate::pool`] per `acquire_retry_attempts` /
    /// `acquire_retry_delay`; this method itself performs a single attempt.
    async fn create(&self) -> Result<Self::Connection>;

    /// Checks `conn` is still usable, truthy only if it completes within
    /// `validate_timeout` (the pool enforces the timeout; this method just
    /// runs the check). `test_query` is the configured `test_connection_query`,
    /// when set — a driver that has a cheaper native liveness check is free to
    /// ignore it and use that instead.
    async fn validate(&self, conn: &mut Self::Connection, test_query: Option<&str>) -> Result<bool>;

    /// Unconditionally closes `conn`, swallowing any error the underlying
    /// driver raises while doing so (quiet-close, spec §4.1).
    async fn destroy(&self, conn: Self::Connection);

    /// Prepares a statement for repeated execution with the given
    /// parameter placeholders. `args` is recorded into the statement's
    /// cache key (spec §3, `StatementKey`) but not bound here — binding
    /// happens per-execution via [`StatementOps::bind`].
    async fn prepare_statement(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        args: &[Value],
    ) -> Result<Self::Statement>;

    /// Prepares a callable (stored-procedure) statement. Distinguished from
    /// `prepare_statement` in the statement-cache key's method identity
    /// (spec §3).
    async fn prepare_call(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        args: &[Value],
    ) -> Result<Self::Statement>;

    /// Creates an ad-hoc (uncached) statement, as used by
    /// `ConnectionProxy::create_statement` (spec §4.7.1).
    async fn create_statement(&self, conn: &mut Self::Connection) -> Result<Self::Statement>;

    /// Closes a statement handle directly (used when the statement cache
    /// declines to retain it, or on final eviction).
    async fn close_statement(&self, stmt: Self::Statement);

    /// Executes `sql` against `stmt`, returning a result set.
    async fn execute_query(
        &self,
        stmt: &mut Self::Statement,
        sql: &str,
        args: &[Value],
    ) -> Result<Self::ResultSet>;

    /// Executes `sql` against `stmt`, returning an affected-row count.
    async fn execute_update(
        &self,
        stmt: &mut Self::Statement,
        sql: &str,
        args: &[Value],
    ) -> Result<u64>;

    /// Advances `rs` to the next row, returning `false` once exhausted.
    async fn result_set_next(&self, rs: &mut Self::ResultSet) -> Result<bool>;

    /// Closes a result-set handle.
    async fn close_result_set(&self, rs: Self::ResultSet);

    /// Retrieves a metadata handle for `conn`.
    async fn metadata(&self, conn: &mut Self::Connection) -> Result<Self::Metadata>;

    /// Forwards an `abort` call to the raw connection (spec §4.7.1,
    /// `ConnectionProxy::abort`). Distinct from `destroy`: an aborted
    /// connection is still expected to report its resources released
    /// immediately rather than via the quiet-close path, but most drivers
    /// have no separate notion of this, so the default is a no-op.
    async fn abort(&self, _conn: &mut Self::Connection) -> Result<()> {
        Ok(())
    }

    /// Clears SQL warnings accumulated on `conn` (spec §6,
    /// `clear_sql_warnings`; spec §9's open question on whether a failure
    /// here should invalidate the connection is resolved in
    /// [`crate::cache::StatementCache::restore`]'s caller). Default no-op
    /// for drivers without a warnings concept.
    async fn clear_warnings(&self, _conn: &mut Self::Connection) -> Result<()> {
        Ok(())
    }

    /// Cancels an in-flight or reusable statement (spec §4.7.2, `cancel`).
    /// Default no-op for drivers without server-side cancellation.
    async fn cancel_statement(&self, _stmt: &mut Self::Statement) -> Result<()> {
        Ok(())
    }

    /// Retrieves the auto-generated keys produced by `stmt`'s last execution
    /// (spec §4.7.2, `getGeneratedKeys`).
    async fn generated_keys(&self, stmt: &mut Self::Statement) -> Result<Self::ResultSet>;
}
