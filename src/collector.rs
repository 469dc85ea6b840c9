//! The per-connection-proxy error accumulator (spec §4.5). Most connections
//! never raise a non-transient error, so the backing queue is allocated only
//! on the first call to [`ExceptionCollector::add`] — the same lazy-
//! singleton-via-double-checked-publication idiom spec §9 calls for,
//! implemented with `once_cell::sync::OnceCell` rather than hand-rolled
//! double-checked locking the way the teacher driver reaches for `once_cell`
//! wherever it needs exactly-once lazy init (e.g. its topology watchers).

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Error;

/// Accumulates the non-transient driver errors raised on one connection
/// proxy's lifetime. Single-writer (the proxy's own call path), single-reader
/// (the `close` path that takes the final snapshot) per spec §5, so the
/// `Mutex` here is never contended in practice — it exists to give the lazy
/// cell interior mutability, not to arbitrate concurrent writers.
#[derive(Default)]
pub(crate) struct ExceptionCollector {
    errors: OnceCell<Mutex<Vec<Error>>>,
}

impl ExceptionCollector {
    pub(crate) fn new() -> Self {
        ExceptionCollector {
            errors: OnceCell::new(),
        }
    }

    /// Records `error` iff it is classified non-transient (spec §4.5:
    /// "excludes transient connection-timeout and serialization-failure
    /// kinds, but includes transient-connection-unavailable" — i.e. only
    /// errors that indicate the underlying connection itself is suspect get
    /// recorded; errors that are merely timing artifacts of one call do
    /// not).
    pub(crate) fn add(&self, error: Error) {
        if error.is_transient() {
            return;
        }
        self.errors
            .get_or_init(|| Mutex::new(Vec::new()))
            .lock()
            .push(error);
    }

    /// `true` if no non-transient error has been recorded yet.
    pub(crate) fn is_empty(&self) -> bool {
        match self.errors.get() {
            None => true,
            Some(errors) => errors.lock().is_empty(),
        }
    }

    /// Takes a snapshot of everything recorded so far. Called once, at
    /// connection-proxy close time, to decide whether the pooled handle
    /// should be treated as invalid (spec §4.5's decision rule).
    pub(crate) fn snapshot(&self) -> Vec<Error> {
        match self.errors.get() {
            None => Vec::new(),
            Some(errors) => errors.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DriverErrorInfo, ErrorKind};

    #[test]
    fn never_allocates_until_first_non_transient_error() {
        let collector = ExceptionCollector::new();
        assert!(collector.is_empty());
        assert!(collector.errors.get().is_none());
    }

    #[test]
    fn serialization_failures_are_excluded() {
        let collector = ExceptionCollector::new();
        let err: Error = ErrorKind::Driver(DriverErrorInfo::new("40001").serialization_failure()).into();
        collector.add(err);
        assert!(collector.is_empty());
    }

    #[test]
    fn connection_timeouts_are_excluded() {
        let collector = ExceptionCollector::new();
        let err: Error = ErrorKind::Driver(DriverErrorInfo::new("timed out").connection_timeout()).into();
        collector.add(err);
        assert!(collector.is_empty());
    }

    #[test]
    fn ordinary_driver_errors_are_recorded() {
        let collector = ExceptionCollector::new();
        collector.add(ErrorKind::Driver(DriverErrorInfo::new("syntax error")).into());
        assert!(!collector.is_empty());
        assert_eq!(collector.snapshot().len(), 1);
    }
}
