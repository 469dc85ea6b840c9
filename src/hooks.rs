//! Registered hook callables for lifecycle and execution events (spec §4.6).
//! Three families are append-only sequences, assembled once via
//! [`HookRegistryBuilder`] during configuration and frozen into an
//! [`HookRegistry`] at `DataSource::start()` (spec §5: "frozen after
//! `start()` and read without synchronization thereafter") — the same shape
//! the teacher driver uses for its own frozen, `start()`-time configuration
//! (`ConnectionPoolOptions` is read, validated, and never mutated again once
//! the pool worker is running).
//!
//! The dynamic-proxy "invocation handler" pattern the original system builds
//! hooks on top of has no equivalent here (spec §9: "replace with generated
//! trait/interface implementations ... explicit method-enum dispatch with a
//! small hook list traversed per call"); each hook family below is exactly
//! that small, explicitly-typed list.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::value::Value;

/// Fires before (almost) every proxied method call, excluding the
/// unrestricted phase (`close`/`isClosed`, `unwrap`/`isWrapperFor`, identity
/// methods) per spec §4.7. Purely observational — it cannot veto or alter the
/// call.
pub type MethodInvocationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Fires once when a `ResultSetProxy` closes, with the originating SQL, the
/// bound parameters, the number of rows observed, and the elapsed time
/// between first and last row.
pub type ResultSetRetrievalHook = Arc<dyn Fn(&str, &[Value], u64, Duration) + Send + Sync>;

/// A connection lifecycle hook (`OnInit`/`OnGet`/`OnRestore`/`OnDestroy`).
/// These compose as simple sequences, not onions (spec §4.6) — every
/// registered hook for the family runs, in registration order, with no
/// short-circuiting.
pub type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The continuation a [`StatementExecutionHook`] must invoke to chain to the
/// next hook (or, for the innermost registered hook, to the real execution).
pub type Proceed<'a> = Box<dyn FnOnce() -> BoxFuture<'a, crate::error::Result<()>> + Send + 'a>;

/// Context passed to each hook in the `executeQuery`/`executeUpdate` onion.
pub struct ExecutionContext<'a> {
    pub sql: &'a str,
    pub params: &'a [Value],
}

/// Wraps every `execute*` call (spec §4.6). Hooks compose as an onion: each
/// hook receives `proceed`, the continuation representing "everything
/// registered after me, terminating in the real call", and decides whether
/// (and when) to invoke it. The real execution result is not threaded
/// through the hook chain's type — hooks observe and time the call via
/// `proceed`'s `Result<()>`, while the statement proxy captures the actual
/// driver return value through a side channel it owns, the same separation
/// the teacher driver draws between its command-monitoring hooks (which see
/// timing and outcome) and the command's actual typed response (which they
/// never touch).
pub trait StatementExecutionHook: Send + Sync {
    fn around<'a>(
        &'a self,
        ctx: &'a ExecutionContext<'a>,
        proceed: Proceed<'a>,
    ) -> BoxFuture<'a, crate::error::Result<()>>;
}

/// Builds an [`HookRegistry`] during configuration. Every `add_*` method
/// appends to its family's sequence; call [`HookRegistryBuilder::build`] once
/// configuration is complete to obtain the frozen, read-only registry.
#[derive(Default)]
pub(crate) struct HookRegistryBuilder {
    method_invocation: Vec<MethodInvocationHook>,
    statement_execution: Vec<Arc<dyn StatementExecutionHook>>,
    result_set_retrieval: Vec<ResultSetRetrievalHook>,
    on_init: Vec<LifecycleHook>,
    on_get: Vec<LifecycleHook>,
    on_restore: Vec<LifecycleHook>,
    on_destroy: Vec<LifecycleHook>,
}

impl HookRegistryBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_method_invocation_hook(&mut self, hook: MethodInvocationHook) -> &mut Self {
        self.method_invocation.push(hook);
        self
    }

    pub(crate) fn add_statement_execution_hook(
        &mut self,
        hook: Arc<dyn StatementExecutionHook>,
    ) -> &mut Self {
        self.statement_execution.push(hook);
        self
    }

    pub(crate) fn add_result_set_retrieval_hook(
        &mut self,
        hook: ResultSetRetrievalHook,
    ) -> &mut Self {
        self.result_set_retrieval.push(hook);
        self
    }

    pub(crate) fn add_on_init(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_init.push(hook);
        self
    }

    pub(crate) fn add_on_get(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_get.push(hook);
        self
    }

    pub(crate) fn add_on_restore(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_restore.push(hook);
        self
    }

    pub(crate) fn add_on_destroy(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_destroy.push(hook);
        self
    }

    pub(crate) fn build(self) -> HookRegistry {
        HookRegistry {
            method_invocation: self.method_invocation,
            statement_execution: self.statement_execution,
            result_set_retrieval: self.result_set_retrieval,
            on_init: self.on_init,
            on_get: self.on_get,
            on_restore: self.on_restore,
            on_destroy: self.on_destroy,
        }
    }
}

/// The frozen, read-only hook registry a `DataSource` builds once at
/// `start()` and shares (via `Arc`) with every proxy it hands out.
pub(crate) struct HookRegistry {
    method_invocation: Vec<MethodInvocationHook>,
    statement_execution: Vec<Arc<dyn StatementExecutionHook>>,
    result_set_retrieval: Vec<ResultSetRetrievalHook>,
    on_init: Vec<LifecycleHook>,
    on_get: Vec<LifecycleHook>,
    on_restore: Vec<LifecycleHook>,
    on_destroy: Vec<LifecycleHook>,
}

impl HookRegistry {
    pub(crate) fn empty() -> Self {
        HookRegistryBuilder::new().build()
    }

    /// Runs every registered method-invocation hook, in registration order.
    pub(crate) fn fire_method_invocation(&self, method: &str) {
        for hook in &self.method_invocation {
            hook(method);
        }
    }

    /// Runs every registered result-set-retrieval hook, in registration
    /// order.
    pub(crate) fn fire_result_set_retrieval(
        &self,
        sql: &str,
        params: &[Value],
        row_count: u64,
        elapsed: Duration,
    ) {
        for hook in &self.result_set_retrieval {
            hook(sql, params, row_count, elapsed);
        }
    }

    /// Invokes the `OnInit` sequence in registration order.
    pub(crate) async fn fire_on_init(&self) {
        for hook in &self.on_init {
            hook().await;
        }
    }

    /// Invokes the `OnGet` sequence in registration order.
    pub(crate) async fn fire_on_get(&self) {
        for hook in &self.on_get {
            hook().await;
        }
    }

    /// Invokes the `OnRestore` sequence in registration order.
    pub(crate) async fn fire_on_restore(&self) {
        for hook in &self.on_restore {
            hook().await;
        }
    }

    /// Invokes the `OnDestroy` sequence in registration order.
    pub(crate) async fn fire_on_destroy(&self) {
        for hook in &self.on_destroy {
            hook().await;
        }
    }

    /// Runs the statement-execution onion around `terminal`, the closure
    /// performing the real driver call. S5's ordering guarantee (hook A
    /// registered before B yields `A.before, B.before, real, B.after,
    /// A.after`) falls out of building the chain from the innermost
    /// (terminal) link outward, last-registered-wraps-innermost.
    pub(crate) async fn fire_statement_execution<'a>(
        &'a self,
        ctx: &'a ExecutionContext<'a>,
        terminal: impl FnOnce() -> BoxFuture<'a, crate::error::Result<()>> + Send + 'a,
    ) -> crate::error::Result<()> {
        let mut chain: Proceed<'a> = Box::new(terminal);
        for hook in self.statement_execution.iter().rev() {
            let hook = hook.clone();
            let next = chain;
            chain = Box::new(move || {
                Box::pin(async move { hook.around(ctx, next).await })
                    as BoxFuture<'a, crate::error::Result<()>>
            });
        }
        chain().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct RecordingHook {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl StatementExecutionHook for RecordingHook {
        fn around<'a>(
            &'a self,
            ctx: &'a ExecutionContext<'a>,
            proceed: Proceed<'a>,
        ) -> BoxFuture<'a, crate::error::Result<()>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{}.before", self.name));
                let result = proceed().await;
                self.log.lock().unwrap().push(format!("{}.after", self.name));
                let _ = ctx.sql;
                result
            })
        }
    }

    #[tokio::test]
    async fn statement_execution_hooks_compose_as_an_onion() {
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = HookRegistryBuilder::new();
        builder.add_statement_execution_hook(Arc::new(RecordingHook {
            name: "A",
            log: log.clone(),
        }));
        builder.add_statement_execution_hook(Arc::new(RecordingHook {
            name: "B",
            log: log.clone(),
        }));
        let registry = builder.build();

        let ctx = ExecutionContext {
            sql: "select 1",
            params: &[],
        };
        let inner_log = log.clone();
        registry
            .fire_statement_execution(&ctx, move || {
                Box::pin(async move {
                    inner_log.lock().unwrap().push("real".to_string());
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["A.before", "B.before", "real", "B.after", "A.after"]
        );
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_registration_order() {
        let log: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = HookRegistryBuilder::new();
        let l1 = log.clone();
        builder.add_on_init(Arc::new(move || {
            let l1 = l1.clone();
            Box::pin(async move { l1.lock().unwrap().push(1) })
        }));
        let l2 = log.clone();
        builder.add_on_init(Arc::new(move || {
            let l2 = l2.clone();
            Box::pin(async move { l2.lock().unwrap().push(2) })
        }));
        let registry = builder.build();
        registry.fire_on_init().await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
