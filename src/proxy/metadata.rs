//! The metadata proxy (spec §4.7.1, `getMetaData`): the thinnest proxy in
//! the tree — it exists only to answer `getConnection()` with the live
//! connection proxy rather than handing back the raw metadata handle's own
//! (driver-specific, often connection-less) notion of its owner.

use tokio::sync::Mutex as AsyncMutex;

use crate::driver::RawConnectionFactory;

use super::connection::ConnectionProxy;

/// A virtual metadata handle. Most of the relational-driver metadata
/// surface (`getTables`, `getColumns`, `getPrimaryKeys`, ...) is exposed by
/// the embedder's own `F::Metadata` type; `sqlpool` only adds the
/// `getConnection()` override the proxy hierarchy requires.
pub struct MetadataProxy<F: RawConnectionFactory> {
    connection: ConnectionProxy<F>,
    raw: AsyncMutex<F::Metadata>,
}

impl<F: RawConnectionFactory> MetadataProxy<F> {
    pub(crate) fn new(connection: ConnectionProxy<F>, raw: F::Metadata) -> Self {
        MetadataProxy {
            connection,
            raw: AsyncMutex::new(raw),
        }
    }

    /// Returns the connection this metadata handle was produced from (spec
    /// §4.7.1).
    pub fn get_connection(&self) -> ConnectionProxy<F> {
        self.connection.clone()
    }

    /// Locks and exposes the embedder's raw metadata handle directly — the
    /// Rust-idiomatic substitute for JDBC's reflection-based `unwrap(T)`
    /// (spec §4.7's "unrestricted phase"): the concrete type is already
    /// known statically, so there's no interface to unwrap through.
    pub async fn raw(&self) -> tokio::sync::MutexGuard<'_, F::Metadata> {
        self.raw.lock().await
    }
}
