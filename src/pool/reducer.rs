//! The background idle-reduction task (spec §4.3). A single recurring
//! `tokio` task, cooperatively stopped at `DataSource::close()`, generalized
//! from the teacher driver's own periodic background task
//! (`cmap::background`) that runs on an interval for as long as the pool it
//! belongs to is alive.
//!
//! All of the actual reduction decision (sampling the taken ratio, picking
//! how many idle handles to destroy) lives in [`super::worker::PoolWorker`]
//! — this module is only the clock that ticks it, kept separate so the
//! worker's own state machine doesn't need to own a `tokio::time::interval`.

use std::time::Duration;

use super::manager::PoolManager;
use crate::driver::RawConnectionFactory;

/// Spawns the recurring reducer task. Returns a handle whose `Drop` stops
/// the task — held by the `DataSource`/`ObjectPool` facade for exactly as
/// long as the pool itself is alive.
pub(crate) fn spawn<F: RawConnectionFactory>(
    manager: PoolManager<F>,
    interval: Duration,
) -> ReducerHandle {
    let task = crate::runtime::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so the pool gets at
        // least one full interval of runtime before its first reduction.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            manager.reducer_tick().await;
        }
    });
    ReducerHandle { _task: task }
}

/// Keeps the reducer task alive. Dropping this aborts the task — there is
/// nothing left for it to do once the pool it serves is gone.
pub(crate) struct ReducerHandle {
    _task: crate::runtime::AsyncJoinHandle<()>,
}

impl Drop for ReducerHandle {
    fn drop(&mut self) {
        self._task.abort();
    }
}
