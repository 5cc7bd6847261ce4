//! Ambient per-request capture context
//!
//! Each captured request runs inside a task-local scope holding its
//! correlation id and start time. Any code awaited within that scope
//! (handlers, data-access calls, timers) can read it through [`current`]
//! without having it passed as a parameter.
//!
//! Task-locals do not follow work onto new tasks by themselves; use
//! [`spawn`] instead of `tokio::spawn` when background work should stay
//! attributed to the request that started it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Correlation data visible to everything running on behalf of one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Id of the persisted request row, once known
    pub request_id: Option<i64>,

    /// Monotonic start of request handling
    pub start_time: Instant,

    /// Ephemeral id used to link queries before the request row exists
    pub correlation_id: Option<Arc<str>>,
}

impl RequestContext {
    /// Fresh context for an inbound request with a newly minted correlation id
    pub fn new_request() -> Self {
        Self {
            request_id: None,
            start_time: Instant::now(),
            correlation_id: Some(Arc::from(uuid::Uuid::new_v4().to_string())),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Milliseconds elapsed since `start_time`
    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

/// Run `fut` with `ctx` as the ambient context
///
/// The scope covers every await point inside `fut`. Nested calls shadow the
/// outer context until they return.
pub async fn run<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Synchronous variant of [`run`]
pub fn run_sync<F, R>(ctx: RequestContext, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT.sync_scope(ctx, f)
}

/// Context of the nearest enclosing scope, or `None` outside any scope
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Spawn a task that inherits the caller's context (if any)
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(ctx) => tokio::spawn(CURRENT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx_with(correlation_id: &str) -> RequestContext {
        RequestContext {
            request_id: None,
            start_time: Instant::now(),
            correlation_id: Some(Arc::from(correlation_id)),
        }
    }

    fn current_correlation() -> Option<String> {
        current().and_then(|c| c.correlation_id().map(str::to_string))
    }

    #[tokio::test]
    async fn test_no_context_outside_scope() {
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_context_survives_await_points() {
        let seen = run(ctx_with("req-a"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
            current_correlation()
        })
        .await;

        assert_eq!(seen.as_deref(), Some("req-a"));
        assert!(current().is_none(), "scope must end with the future");
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_outer() {
        run(ctx_with("outer"), async {
            let inner = run(ctx_with("inner"), async { current_correlation() }).await;
            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(current_correlation().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let a = tokio::spawn(run(ctx_with("a"), async {
            let mut seen = Vec::new();
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.push(current_correlation());
            }
            seen
        }));
        let b = tokio::spawn(run(ctx_with("b"), async {
            let mut seen = Vec::new();
            for _ in 0..10 {
                tokio::task::yield_now().await;
                seen.push(current_correlation());
            }
            seen
        }));

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.iter().all(|c| c.as_deref() == Some("a")));
        assert!(b.iter().all(|c| c.as_deref() == Some("b")));
    }

    #[tokio::test]
    async fn test_spawn_inherits_context() {
        let handle = run(ctx_with("parent"), async {
            spawn(async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                current_correlation()
            })
        })
        .await;

        assert_eq!(handle.await.unwrap().as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn test_plain_tokio_spawn_does_not_inherit() {
        let handle = run(ctx_with("parent"), async {
            tokio::spawn(async { current_correlation() })
        })
        .await;

        assert_eq!(handle.await.unwrap(), None);
    }

    #[test]
    fn test_run_sync() {
        let seen = run_sync(ctx_with("sync"), current_correlation);
        assert_eq!(seen.as_deref(), Some("sync"));
    }

    #[test]
    fn test_new_request_mints_unique_correlation_ids() {
        let a = RequestContext::new_request();
        let b = RequestContext::new_request();
        assert!(a.request_id.is_none());
        assert_ne!(a.correlation_id(), b.correlation_id());
    }
}
