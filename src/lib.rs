//! `sqlpool`: an async, bounded, fair-capable connection pool with a keyed
//! prepared-statement cache layered over each pooled connection.
//!
//! The crate is driver-agnostic: implement [`RawConnectionFactory`] for
//! whatever wire protocol you have, then drive it through [`DataSource`],
//! the single facade tying configuration, the hook registry, the pool, and
//! the statement cache together. See `SPEC_FULL.md` for the full
//! specification and `DESIGN.md` for the grounding ledger behind this
//! implementation.
//!
//! ```no_run
//! use sqlpool::{DataSource, PoolConfig};
//! # use async_trait::async_trait;
//! # struct MyFactory;
//! # #[async_trait]
//! # impl sqlpool::RawConnectionFactory for MyFactory {
//! #     type Connection = (); type Statement = (); type ResultSet = (); type Metadata = ();
//! #     async fn create(&self) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn validate(&self, _c: &mut (), _q: Option<&str>) -> sqlpool::Result<bool> { Ok(true) }
//! #     async fn destroy(&self, _c: ()) {}
//! #     async fn prepare_statement(&self, _c: &mut (), _sql: &str, _a: &[sqlpool::Value]) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn prepare_call(&self, _c: &mut (), _sql: &str, _a: &[sqlpool::Value]) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn create_statement(&self, _c: &mut ()) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn close_statement(&self, _s: ()) {}
//! #     async fn execute_query(&self, _s: &mut (), _sql: &str, _a: &[sqlpool::Value]) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn execute_update(&self, _s: &mut (), _sql: &str, _a: &[sqlpool::Value]) -> sqlpool::Result<u64> { Ok(0) }
//! #     async fn result_set_next(&self, _r: &mut ()) -> sqlpool::Result<bool> { Ok(false) }
//! #     async fn close_result_set(&self, _r: ()) {}
//! #     async fn metadata(&self, _c: &mut ()) -> sqlpool::Result<()> { Ok(()) }
//! #     async fn generated_keys(&self, _s: &mut ()) -> sqlpool::Result<()> { Ok(()) }
//! # }
//! # async fn run() -> sqlpool::Result<()> {
//! let ds = DataSource::new(MyFactory, PoolConfig::default());
//! ds.start()?;
//! let conn = ds.get().await?;
//! let stmt = conn.prepare_statement("select 1", vec![]).await?;
//! stmt.close().await?;
//! conn.close().await?;
//! ds.close().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod collector;
mod config;
mod datasource;
mod driver;
mod error;
mod hooks;
mod pool;
mod proxy;
mod runtime;
mod value;

pub use config::{
    CacheConfig, ConnectionDefaults, IsolationLevel, LoggingThresholds, Polarity, PoolConfig,
    Restriction, STATEMENT_CACHE_MAX_SIZE_CAP,
};
pub use datasource::{DataSource, HooksBuilder, TakenConnectionsReport};
pub use driver::RawConnectionFactory;
pub use error::{DriverErrorInfo, Error, ErrorKind, Result};
pub use hooks::{
    ExecutionContext, LifecycleHook, MethodInvocationHook, Proceed, ResultSetRetrievalHook,
    StatementExecutionHook,
};
pub use pool::TakenSnapshot;
pub use proxy::{ConnectionProxy, MetadataProxy, ResultSetProxy, StatementProxy};
pub use tokio_util::sync::CancellationToken;
pub use value::Value;
