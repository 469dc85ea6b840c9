//! The per-connection prepared-statement cache (spec §4.4). Each
//! [`crate::pool::PooledHandle`] owns one [`StatementCache`], keyed by
//! [`StatementKey`] and bounded by `statement_cache_max_size`. Built on
//! `moka::sync::Cache` the way the teacher driver leans on off-the-shelf
//! concurrent collections rather than hand-rolling its own locking scheme
//! wherever a well-tested one already exists.
//!
//! `moka`'s own `get_with`/`try_get_with` serialize concurrent producers on
//! the same key, blocking every loser until the winner finishes. Spec §4.4's
//! race is different: every racing caller must independently produce its
//! statement, and the losers get their genuinely-produced statement back as
//! an *uncached* holder rather than being blocked or having their work
//! discarded. So this cache is built from the plain `Cache` primitive with
//! manual insert-if-absent logic instead.

pub(crate) mod holder;
pub(crate) mod key;

use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::driver::RawConnectionFactory;
use crate::runtime;

pub(crate) use holder::StatementHolder;
pub(crate) use key::{ConnectionId, MethodIdentity, StatementKey};

/// A keyed, capacity-bounded cache of prepared statements belonging to a
/// single connection. Generic over the embedder's [`RawConnectionFactory`]
/// so eviction can close the underlying raw statement without the cache
/// itself knowing anything about the wire protocol.
pub(crate) struct StatementCache<F: RawConnectionFactory> {
    factory: Arc<F>,
    entries: Option<Cache<StatementKey, Arc<StatementHolder<F::Statement>>>>,
}

impl<F: RawConnectionFactory> StatementCache<F> {
    /// Builds a cache with the given capacity. `max_size == 0` disables
    /// caching entirely: every [`StatementCache::take`] then produces an
    /// uncached holder and the borrowing connection is solely responsible
    /// for closing it.
    pub(crate) fn new(factory: Arc<F>, max_size: usize) -> Self {
        if max_size == 0 {
            return StatementCache {
                factory,
                entries: None,
            };
        }

        let close_factory = factory.clone();
        let entries = Cache::builder()
            .max_capacity(max_size as u64)
            .eviction_listener(move |_key, holder: Arc<StatementHolder<F::Statement>>, cause| {
                // `remove`/`remove_all` bypass the listener entirely (moka
                // does not invoke it for explicit `Cache::remove` calls),
                // so anything reaching this closure is a genuine
                // size/TTL-driven LRU eviction (spec §4.4).
                debug_assert!(!matches!(cause, RemovalCause::Explicit));
                #[cfg(feature = "tracing")]
                tracing::debug!(?cause, "statement cache entry evicted");
                if let Some(holder::Lifecycle::Available) = holder.mark_evicted() {
                    close_evicted(close_factory.clone(), holder);
                }
                // If the prior state was `InUse`, the borrowing caller will
                // observe the `Evicted` state on restore and close it then.
            })
            .build();

        StatementCache {
            factory,
            entries: Some(entries),
        }
    }

    /// Looks up `key`. On a cache hit that wins the `AVAILABLE -> IN_USE`
    /// race, returns the existing holder. On a miss, or a hit that loses the
    /// race (already `IN_USE` or mid-eviction), runs `produce` to create a
    /// fresh statement and either installs it as the new cache entry (if it
    /// is the first producer to finish for this key) or hands it back as an
    /// uncached holder.
    pub(crate) async fn take<Fut>(
        &self,
        key: StatementKey,
        sql_text: &str,
        produce: impl FnOnce() -> Fut,
    ) -> crate::error::Result<Arc<StatementHolder<F::Statement>>>
    where
        Fut: std::future::Future<Output = crate::error::Result<F::Statement>>,
    {
        let entries = match &self.entries {
            None => {
                let raw = produce().await?;
                return Ok(Arc::new(StatementHolder::new_uncached(
                    raw,
                    sql_text.to_string(),
                )));
            }
            Some(entries) => entries,
        };

        if let Some(existing) = entries.get(&key) {
            if existing.try_take() {
                #[cfg(feature = "tracing")]
                tracing::debug!("statement cache hit");
                return Ok(existing);
            }
            // Lost the race (in use or being evicted): fall through and
            // produce our own, uncached copy.
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("statement cache miss");
        let raw = produce().await?;
        let holder = Arc::new(StatementHolder::new_cached(raw, sql_text.to_string(), key.clone()));

        // `get_with_if` isn't available on a plain `Cache`; emulate
        // insert-if-absent by re-checking right before inserting. A narrow
        // window remains in which two producers both insert, but the loser's
        // entry is immediately evicted by moka's own key collision handling
        // (the second `insert` simply replaces the first) and since a
        // freshly produced holder always starts `IN_USE`, nothing is ever
        // silently dropped.
        if entries.contains_key(&key) {
            return Ok(Arc::new(StatementHolder::new_uncached(
                holder.take_raw().expect("freshly produced holder"),
                sql_text.to_string(),
            )));
        }
        entries.insert(key, holder.clone());
        Ok(holder)
    }

    /// Returns a borrowed statement to the cache (spec §4.4, the `restore`
    /// operation). If the holder was concurrently evicted, closes its raw
    /// statement instead — the caller has nothing further to do either way.
    pub(crate) async fn restore(&self, holder: Arc<StatementHolder<F::Statement>>) {
        if !holder.is_cached() {
            self.close(holder).await;
            return;
        }
        if !holder.try_restore() {
            self.close(holder).await;
        }
    }

    /// Removes a single cached entry by key (spec §4.4, `remove`), closing
    /// the underlying statement unconditionally. Used when a connection-level
    /// operation invalidates one cached statement (e.g. a failed
    /// `clearWarnings` during restore) without tearing down the whole cache.
    pub(crate) async fn remove(&self, key: &StatementKey) {
        if let Some(entries) = &self.entries {
            // `Cache::remove` (unlike `invalidate`) does not invoke the
            // eviction listener, so this is the only path besides
            // `remove_all` that performs the unconditional, lifecycle-
            // independent close spec §4.4 calls for.
            if let Some(holder) = entries.remove(key) {
                holder.mark_evicted();
                self.close_raw(&holder).await;
            }
        }
    }

    /// Drops every cached entry, closing each underlying statement
    /// unconditionally (spec §4.4, `removeAll`). Used on connection
    /// destruction and on `DataSource::close()`.
    pub(crate) async fn remove_all(&self) {
        let Some(entries) = &self.entries else {
            return;
        };
        let keys: Vec<_> = entries.iter().map(|(k, _)| (*k).clone()).collect();
        for key in keys {
            if let Some(holder) = entries.remove(&key) {
                holder.mark_evicted();
                self.close_raw(&holder).await;
            }
        }
    }

    /// Closes a single holder directly — used for uncached holders and for
    /// cached holders that lost the restore race.
    async fn close(&self, holder: Arc<StatementHolder<F::Statement>>) {
        self.close_raw(&holder).await;
    }

    async fn close_raw(&self, holder: &StatementHolder<F::Statement>) {
        if let Some(raw) = holder.take_raw() {
            self.factory.close_statement(raw).await;
        }
    }
}

/// Spawns the async close of a holder whose raw statement is sitting
/// `Available` at the moment moka's synchronous eviction listener fires. The
/// listener itself cannot `.await`, so the actual driver call happens on a
/// detached task, matching the teacher driver's pattern of spawning
/// fire-and-forget cleanup work off of synchronous callback paths.
fn close_evicted<F: RawConnectionFactory>(factory: Arc<F>, holder: Arc<StatementHolder<F::Statement>>) {
    if let Some(raw) = holder.take_raw() {
        runtime::spawn(async move {
            factory.close_statement(raw).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::Result;
    use crate::value::Value;

    struct CountingFactory {
        closed: AtomicU32,
    }

    #[async_trait]
    impl RawConnectionFactory for CountingFactory {
        type Connection = ();
        type Statement = u32;
        type ResultSet = ();
        type Metadata = ();

        async fn create(&self) -> Result<Self::Connection> {
            Ok(())
        }
        async fn validate(&self, _conn: &mut Self::Connection, _test_query: Option<&str>) -> Result<bool> {
            Ok(true)
        }
        async fn destroy(&self, _conn: Self::Connection) {}
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
        async fn close_statement(&self, _stmt: Self::Statement) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
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

    fn key(n: u64) -> StatementKey {
        StatementKey::new(
            ConnectionId(n),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![],
        )
    }

    #[tokio::test]
    async fn disabled_cache_always_produces_uncached_holders() {
        let factory = Arc::new(CountingFactory {
            closed: AtomicU32::new(0),
        });
        let cache = StatementCache::new(factory, 0);
        let holder = cache
            .take(key(1), "select 1", || async { Ok(7u32) })
            .await
            .unwrap();
        assert!(!holder.is_cached());
    }

    #[tokio::test]
    async fn cache_hit_returns_same_holder() {
        let factory = Arc::new(CountingFactory {
            closed: AtomicU32::new(0),
        });
        let cache = StatementCache::new(factory, 10);

        let first = cache
            .take(key(1), "select 1", || async { Ok(1u32) })
            .await
            .unwrap();
        cache.restore(first.clone()).await;

        let second = cache
            .take(key(1), "select 1", || async { Ok(2u32) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn remove_all_closes_every_entry() {
        let factory = Arc::new(CountingFactory {
            closed: AtomicU32::new(0),
        });
        let cache = StatementCache::new(factory.clone(), 10);

        let h1 = cache
            .take(key(1), "a", || async { Ok(1u32) })
            .await
            .unwrap();
        cache.restore(h1).await;
        let h2 = cache
            .take(key(2), "b", || async { Ok(2u32) })
            .await
            .unwrap();
        cache.restore(h2).await;

        cache.remove_all().await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn restoring_an_uncached_holder_closes_it() {
        let factory = Arc::new(CountingFactory {
            closed: AtomicU32::new(0),
        });
        let cache = StatementCache::new(factory.clone(), 0);

        let holder = cache
            .take(key(1), "select 1", || async { Ok(9u32) })
            .await
            .unwrap();
        cache.restore(holder).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }
}
