//! Active capture context, carried as task-local state
//!
//! A context is active for everything polled inside
//! [`ConsoleCapture::run_with_capture`](crate::ConsoleCapture::run_with_capture).
//! Tasks spawned from inside a context only inherit it when spawned through
//! [`spawn_in_context`].

use std::future::Future;
use tokio::task::JoinHandle;

tokio::task_local! {
    static ACTIVE_CONTEXT: String;
}

/// Context id active on the current task, if any.
pub fn current_context() -> Option<String> {
    ACTIVE_CONTEXT.try_with(|id| id.clone()).ok()
}

pub(crate) async fn scope<F: Future>(context_id: String, fut: F) -> F::Output {
    ACTIVE_CONTEXT.scope(context_id, fut).await
}

pub(crate) fn sync_scope<R>(context_id: String, f: impl FnOnce() -> R) -> R {
    ACTIVE_CONTEXT.sync_scope(context_id, f)
}

/// Spawns `fut` so that it runs under the caller's active context.
///
/// Output from work deferred this way (timers, background retries) stays
/// attributed to the unit that started it, including during that unit's
/// grace period.
pub fn spawn_in_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_context() {
        Some(context_id) => tokio::spawn(ACTIVE_CONTEXT.scope(context_id, fut)),
        None => tokio::spawn(fut),
    }
}
