//! The pool's ownership wrapper around a raw connection (spec §3, entity
//! `PooledHandle`), generalized from the teacher driver's `Connection`
//! (itself the CMAP pool's ownership wrapper around a raw socket).

use std::sync::Arc;
use std::time::Instant;

use crate::cache::{ConnectionId, StatementCache};
use crate::driver::RawConnectionFactory;

/// A point-in-time snapshot of one currently-taken handle, used by
/// `ErrorKind::Timeout`'s attached diagnostics and by
/// `DataSource::show_taken_connections()` (spec §6). Cheap to clone: the
/// captured backtrace, if any, is shared via `Arc`.
#[derive(Clone, Debug)]
pub struct TakenSnapshot {
    pub connection_id: u64,
    pub taken_at: Instant,
    pub last_access_at: Instant,
    pub stack: Option<Arc<std::backtrace::Backtrace>>,
}

/// Bookkeeping the pool worker keeps for a handle currently issued to a
/// caller. The worker cannot see the real `PooledHandle` while it's checked
/// out — ownership moved to the caller — so it tracks just enough to answer
/// `takenHolders()`/`showTakenConnections()` queries and to build a
/// `TakenSnapshot` on a timeout.
#[derive(Clone, Debug)]
pub(crate) struct TakenInfo {
    pub(crate) taken_at: Instant,
    pub(crate) last_access_at: Instant,
    pub(crate) stack: Option<Arc<std::backtrace::Backtrace>>,
}

impl TakenInfo {
    pub(crate) fn capture(capture_stack: bool) -> Self {
        let now = Instant::now();
        TakenInfo {
            taken_at: now,
            last_access_at: now,
            stack: Self::capture_stack(capture_stack),
        }
    }

    #[cfg(feature = "error-backtrace")]
    fn capture_stack(capture_stack: bool) -> Option<Arc<std::backtrace::Backtrace>> {
        capture_stack.then(|| Arc::new(std::backtrace::Backtrace::capture()))
    }

    #[cfg(not(feature = "error-backtrace"))]
    fn capture_stack(_capture_stack: bool) -> Option<Arc<std::backtrace::Backtrace>> {
        None
    }

    pub(crate) fn snapshot(&self, connection_id: ConnectionId) -> TakenSnapshot {
        TakenSnapshot {
            connection_id: connection_id.0,
            taken_at: self.taken_at,
            last_access_at: self.last_access_at,
            stack: self.stack.clone(),
        }
    }
}

/// Whether a [`PooledHandle`] is subject to the pool's bookkeeping
/// (`created`/`available`/`taken` counters, the reducer, `restore`) or was
/// produced outside of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Provenance {
    /// Issued by the `ObjectPool`; `restore`/`sever` return it to pool
    /// bookkeeping.
    Pooled,
    /// Produced directly by `RawConnectionFactory::create`, bypassing the
    /// pool entirely — `DataSource::get_non_pooled()` and the
    /// `allow_connection_after_termination` fallback (spec §4.8).
    NonPooled,
}

/// The pool's record for one live connection: the raw driver handle, its
/// identity, its statement cache, and enough metadata to answer
/// `remainingCreated`/`createdTotal`-style queries.
pub(crate) struct PooledHandle<F: RawConnectionFactory> {
    pub(crate) id: ConnectionId,
    raw: Option<F::Connection>,
    pub(crate) cache: StatementCache<F>,
    factory: Arc<F>,
    pub(crate) version: u64,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) provenance: Provenance,
}

impl<F: RawConnectionFactory> PooledHandle<F> {
    pub(crate) fn new(
        id: ConnectionId,
        raw: F::Connection,
        factory: Arc<F>,
        cache_max_size: usize,
        version: u64,
        provenance: Provenance,
    ) -> Self {
        let now = Instant::now();
        PooledHandle {
            id,
            raw: Some(raw),
            cache: StatementCache::new(factory.clone(), cache_max_size),
            factory,
            version,
            created_at: now,
            last_used_at: now,
            provenance,
        }
    }

    pub(crate) fn raw(&self) -> &F::Connection {
        self.raw.as_ref().expect("PooledHandle raw connection already taken")
    }

    pub(crate) fn raw_mut(&mut self) -> &mut F::Connection {
        self.raw.as_mut().expect("PooledHandle raw connection already taken")
    }

    /// Splits the handle into independent, simultaneously-live borrows of
    /// its raw connection and its statement cache. Needed because preparing
    /// a statement borrows the raw connection mutably (to run the driver
    /// call) for the same duration that it borrows the cache (to install
    /// the result) — two different fields of this struct, so the borrow
    /// checker allows it once split explicitly like this, without resorting
    /// to interior mutability or unsafe aliasing.
    pub(crate) fn split_mut(&mut self) -> (&mut F::Connection, &StatementCache<F>) {
        (
            self.raw.as_mut().expect("PooledHandle raw connection already taken"),
            &self.cache,
        )
    }

    /// Takes ownership of the raw connection, leaving the handle's slot
    /// empty. Used by `destroy`-type paths so a raw connection is closed at
    /// most once even if the handle itself is dropped afterward.
    pub(crate) fn take_raw(&mut self) -> Option<F::Connection> {
        self.raw.take()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.provenance == Provenance::Pooled
    }
}

impl<F: RawConnectionFactory> Drop for PooledHandle<F> {
    /// A safety net, not the primary close path: every ordinary route
    /// (`ObjectPool::destroy`, `ConnectionProxy::close`) already calls
    /// `take_raw()` before a handle is dropped, so `raw` is `None` by then
    /// and this is a no-op. If a handle is dropped without going through
    /// either — a panic unwinding through a borrowed handle, most likely —
    /// this spawns the same quiet-close `destroy` the normal path would have
    /// run, so a raw connection is never simply leaked.
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let factory = self.factory.clone();
            crate::runtime::spawn(async move {
                factory.destroy(raw).await;
            });
        }
    }
}
