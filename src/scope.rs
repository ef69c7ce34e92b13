//! Session-scope wrappers: typed policies over [`Engine::session_scope`].
//!
//! Each wrapper injects a scoped session into a closure and applies one
//! commit/rollback/retry policy. Closures take `&'a mut Session` and return
//! a boxed future borrowing it, so the session cannot escape the scope.
//!
//! All wrappers take the engine explicitly; [`current_engine`] resolves the
//! process-wide default for callers that want it.

use crate::engine::Engine;
use crate::error::Result;
use crate::manager::Manager;
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionOptions};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// The engine held by the process-wide default [`Manager`].
pub async fn current_engine() -> Result<Arc<Engine>> {
    Manager::global().await.engine().await
}

/// Scoped session with caller-chosen options.
///
/// Commits on normal exit iff `opts.auto_commit` resolves true (unset
/// inherits the target's autocommit policy); rolls back and propagates on
/// error. The session is always released.
pub async fn manual<T, F>(engine: &Engine, opts: SessionOptions, f: F) -> Result<T>
where
    T: Send,
    F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
{
    engine.session_scope(opts, f).await
}

/// Scoped session that always commits on success.
pub async fn transactional<T, F>(engine: &Engine, f: F) -> Result<T>
where
    T: Send,
    F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
{
    let opts = SessionOptions {
        auto_commit: Some(true),
        ..SessionOptions::default()
    };
    engine.session_scope(opts, f).await
}

/// Scoped session that never commits; any writes roll back on release.
pub async fn read_only<T, F>(engine: &Engine, f: F) -> Result<T>
where
    T: Send,
    F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
{
    let opts = SessionOptions {
        auto_commit: Some(false),
        ..SessionOptions::default()
    };
    engine.session_scope(opts, f).await
}

/// Scoped session with retry on transient failure.
///
/// Every attempt acquires a fresh session; a session that failed
/// mid-transaction is never reused. Per attempt the commit/rollback policy
/// matches [`manual`]. Between attempts the policy's backoff delay applies.
pub async fn retrying<T, F>(
    engine: &Engine,
    policy: &RetryPolicy,
    opts: SessionOptions,
    mut f: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> FnMut(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
{
    let mut attempt: u32 = 1;
    loop {
        match engine.session_scope(opts.clone(), &mut f).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts() || !policy.should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Scoped block failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Run `f` with the caller's session when one is supplied, leaving its
/// transaction untouched; otherwise acquire a scoped session and apply
/// [`manual`] policy with default options.
pub async fn inject_session<T, F>(
    engine: &Engine,
    existing: Option<&mut Session>,
    f: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
{
    match existing {
        Some(session) => f(session).await,
        None => engine.session_scope(SessionOptions::default(), f).await,
    }
}
