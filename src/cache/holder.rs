use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

/// The three-state lifecycle a cached statement holder moves through (spec
/// §4.4). Represented as a small atomic ordinal per spec §9's guidance that
/// "the three-state protocol carries across all target languages" — no
/// locking is needed to observe or transition it, only a single CAS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Available = 0,
    InUse = 1,
    Evicted = 2,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Available,
            1 => Lifecycle::InUse,
            _ => Lifecycle::Evicted,
        }
    }
}

/// The cache's ownership wrapper around a raw prepared statement (spec §3).
/// A holder with no `state` atom is *uncached*: it was never inserted into
/// the map (bypassed, raced, or produced while the cache was closed) and the
/// caller is solely responsible for closing its raw statement.
pub struct StatementHolder<S> {
    raw: Mutex<Option<S>>,
    pub sql_text: String,
    state: Option<AtomicU8>,
    pub(crate) key: Option<crate::cache::key::StatementKey>,
}

impl<S> StatementHolder<S> {
    /// Constructs a holder that will be tracked by the cache's three-state
    /// protocol, starting in `IN_USE` (spec §4.4: "insert -> IN_USE").
    pub(crate) fn new_cached(
        raw: S,
        sql_text: String,
        key: crate::cache::key::StatementKey,
    ) -> Self {
        StatementHolder {
            raw: Mutex::new(Some(raw)),
            sql_text,
            state: Some(AtomicU8::new(Lifecycle::InUse as u8)),
            key: Some(key),
        }
    }

    /// Constructs an uncached holder: the cache declined to track it, so no
    /// lifecycle atom exists at all.
    pub(crate) fn new_uncached(raw: S, sql_text: String) -> Self {
        StatementHolder {
            raw: Mutex::new(Some(raw)),
            sql_text,
            state: None,
            key: None,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn lifecycle(&self) -> Option<Lifecycle> {
        self.state
            .as_ref()
            .map(|s| Lifecycle::from_u8(s.load(Ordering::Acquire)))
    }

    /// Attempts the `AVAILABLE -> IN_USE` transition a cache hit performs
    /// (spec §4.4). Returns `true` if this caller won the race.
    pub(crate) fn try_take(&self) -> bool {
        match &self.state {
            None => false,
            Some(s) => s
                .compare_exchange(
                    Lifecycle::Available as u8,
                    Lifecycle::InUse as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
        }
    }

    /// Attempts the `IN_USE -> AVAILABLE` transition a `restore` performs.
    /// Returns `true` if this caller won the race; `false` means the holder
    /// was concurrently evicted and the caller must close the raw
    /// statement itself.
    pub(crate) fn try_restore(&self) -> bool {
        match &self.state {
            None => false,
            Some(s) => s
                .compare_exchange(
                    Lifecycle::InUse as u8,
                    Lifecycle::Available as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
        }
    }

    /// Unconditionally marks this holder `EVICTED`, returning the prior
    /// state. Used by the cache's eviction callback.
    pub(crate) fn mark_evicted(&self) -> Option<Lifecycle> {
        self.state.as_ref().map(|s| {
            Lifecycle::from_u8(s.swap(Lifecycle::Evicted as u8, Ordering::AcqRel))
        })
    }

    /// Takes ownership of the raw statement, leaving `None` behind. Used on
    /// every path that closes the underlying handle, so a raw statement is
    /// never closed twice.
    pub(crate) fn take_raw(&self) -> Option<S> {
        self.raw.lock().take()
    }

    /// Parks a raw statement back into the holder after borrowing it for a
    /// driver call. [`StatementHolder::take_raw`]/`put_raw` is the
    /// check-out/check-in pair a [`crate::proxy::StatementProxy`] uses to
    /// get `&mut S` access across an `.await` without holding the holder's
    /// own (synchronous) lock across it.
    pub(crate) fn put_raw(&self, raw: S) {
        *self.raw.lock() = Some(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{ConnectionId, MethodIdentity, StatementKey};

    fn test_key() -> StatementKey {
        StatementKey::new(
            ConnectionId(1),
            MethodIdentity::PrepareStatement { arity: 0 },
            vec![],
        )
    }

    #[test]
    fn cached_holder_starts_in_use() {
        let h = StatementHolder::new_cached(42u32, "select 1".into(), test_key());
        assert_eq!(h.lifecycle(), Some(Lifecycle::InUse));
    }

    #[test]
    fn uncached_holder_has_no_lifecycle() {
        let h = StatementHolder::new_uncached(42u32, "select 1".into());
        assert_eq!(h.lifecycle(), None);
        assert!(!h.is_cached());
        assert!(!h.try_take());
        assert!(!h.try_restore());
    }

    #[test]
    fn restore_then_take_roundtrips() {
        let h = StatementHolder::new_cached(1u32, "x".into(), test_key());
        assert!(h.try_restore());
        assert_eq!(h.lifecycle(), Some(Lifecycle::Available));
        assert!(h.try_take());
        assert_eq!(h.lifecycle(), Some(Lifecycle::InUse));
    }

    #[test]
    fn only_one_concurrent_taker_wins() {
        let h = StatementHolder::new_cached(1u32, "x".into(), test_key());
        h.try_restore();
        assert!(h.try_take());
        // A second taker must fail; the holder is already IN_USE.
        assert!(!h.try_take());
    }

    #[test]
    fn eviction_from_in_use_does_not_lose_state() {
        let h = StatementHolder::new_cached(1u32, "x".into(), test_key());
        let prior = h.mark_evicted();
        assert_eq!(prior, Some(Lifecycle::InUse));
        assert_eq!(h.lifecycle(), Some(Lifecycle::Evicted));
        // restore on an evicted holder must fail so the caller closes it.
        assert!(!h.try_restore());
    }

    #[test]
    fn take_raw_is_idempotent() {
        let h = StatementHolder::new_cached(7u32, "x".into(), test_key());
        assert_eq!(h.take_raw(), Some(7));
        assert_eq!(h.take_raw(), None);
    }
}
