//! Virtual handles implementing the connection/statement/result-set/
//! metadata surface by delegation (spec §4.7). Spec §9 replaces the
//! original system's dynamic-proxy "invocation handler" with "generated
//! trait/interface implementations... explicit method-enum dispatch with a
//! small hook list traversed per call" — in Rust there is no reflection
//! layer to replace at all: each proxy below is a plain struct with
//! inherent `async fn`s, and the "two phases" spec §4.7 describes
//! (unrestricted short-circuit methods vs. restricted, hook-and-
//! restriction-checked ones) fall directly out of which methods exist on
//! which type rather than out of a runtime dispatch table.
//!
//! Every proxy is cheaply `Clone` (an `Arc` around its shared state) so that
//! descendants (`StatementProxy`, `ResultSetProxy`, `MetadataProxy`) can
//! hold a live reference back to their owning `ConnectionProxy` and answer
//! `getConnection()` without borrowing games.

pub(crate) mod connection;
pub(crate) mod metadata;
pub(crate) mod result_set;
pub(crate) mod statement;

pub use connection::ConnectionProxy;
pub use metadata::MetadataProxy;
pub use result_set::ResultSetProxy;
pub use statement::StatementProxy;
