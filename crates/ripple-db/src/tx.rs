//! Transaction helper with post-commit hooks.
//!
//! Handlers can finalize their task record inside their own transaction
//! (`mark_completed`), and the subsystem needs bookkeeping that must only
//! run once that transaction has actually committed. Hooks registered on a
//! [`TxSession`] run after a successful commit; a hook error is reported
//! and swallowed, it never affects the commit result.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;

/// A hook executed after a successful commit.
pub type PostCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// An open transaction plus its registered post-commit hooks.
pub struct TxSession<'t> {
    pub tx: Transaction<'t, Postgres>,
    hooks: Vec<PostCommitHook>,
}

impl<'t> TxSession<'t> {
    /// Register a hook to run after the transaction commits successfully.
    ///
    /// Hooks run in registration order. They are dropped unrun if the
    /// transaction rolls back.
    pub fn register_post_commit_hook(&mut self, hook: PostCommitHook) {
        self.hooks.push(hook);
    }
}

/// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
///
/// Post-commit hooks registered by `f` run after the commit; their errors
/// are reported and swallowed.
pub async fn with_transaction<T, F>(pool: &PgPool, f: F) -> Result<T>
where
    F: for<'s, 't> FnOnce(&'s mut TxSession<'t>) -> BoxFuture<'s, Result<T>>,
{
    let tx = pool.begin().await.context("failed to begin transaction")?;
    let mut session = TxSession {
        tx,
        hooks: Vec::new(),
    };

    match f(&mut session).await {
        Ok(value) => {
            let TxSession { tx, hooks } = session;
            tx.commit().await.context("failed to commit transaction")?;
            for hook in hooks {
                if let Err(err) = hook().await {
                    error!(error = %err, "post-commit hook failed");
                }
            }
            Ok(value)
        }
        Err(err) => {
            let TxSession { tx, .. } = session;
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed after transaction error");
            }
            Err(err)
        }
    }
}
