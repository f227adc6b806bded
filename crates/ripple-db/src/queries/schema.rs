//! Runtime schema provisioning for observed source tables.
//!
//! Tasks tables exist one-per-source and are only known at registration
//! time, so they are created here rather than in the static migrations.
//! All statements are idempotent; `start()` runs them on every boot.

use anyhow::{Context, Result};
use sqlx::PgPool;

use super::TableName;

/// Create a tasks table and its two indexes if they do not exist.
///
/// The unique index enforces one record per `(source_doc_id, task)`; the
/// partial index on `(task, next_run_at)` is the sole index used by the
/// polling query and excludes terminal records to keep the working set
/// small.
pub async fn ensure_tasks_table(pool: &PgPool, table: &TableName) -> Result<()> {
    let create = format!(
        "CREATE TABLE IF NOT EXISTS {table} ( \
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             task TEXT NOT NULL, \
             source_doc_id TEXT NOT NULL, \
             status TEXT NOT NULL CHECK (status IN \
                 ('pending', 'processing', 'processing_dirty', 'completed', 'failed')), \
             next_run_at TIMESTAMPTZ, \
             due_at TIMESTAMPTZ NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
             started_at TIMESTAMPTZ, \
             completed_at TIMESTAMPTZ, \
             last_finalized_at TIMESTAMPTZ, \
             attempts INT NOT NULL DEFAULT 0, \
             first_error_at TIMESTAMPTZ, \
             last_error TEXT, \
             last_success JSONB, \
             execution_history JSONB NOT NULL DEFAULT '[]', \
             last_observed JSONB, \
             handler_version TEXT \
         )"
    );
    sqlx::query(&create)
        .execute(pool)
        .await
        .with_context(|| format!("failed to create tasks table {table}"))?;

    let unique_idx = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_source_doc_task_idx \
         ON {table} (source_doc_id, task)"
    );
    sqlx::query(&unique_idx)
        .execute(pool)
        .await
        .with_context(|| format!("failed to create unique index on {table}"))?;

    let poll_idx = format!(
        "CREATE INDEX IF NOT EXISTS {table}_task_next_run_idx \
         ON {table} (task, next_run_at) WHERE next_run_at IS NOT NULL"
    );
    sqlx::query(&poll_idx)
        .execute(pool)
        .await
        .with_context(|| format!("failed to create polling index on {table}"))?;

    Ok(())
}

/// Attach the change-recording trigger to a source table.
///
/// `CREATE TRIGGER` has no `IF NOT EXISTS`, so the trigger is dropped and
/// recreated.
pub async fn ensure_source_trigger(pool: &PgPool, source: &TableName) -> Result<()> {
    let drop = format!("DROP TRIGGER IF EXISTS ripple_changes_trg ON {source}");
    sqlx::query(&drop)
        .execute(pool)
        .await
        .with_context(|| format!("failed to drop change trigger on {source}"))?;

    let create = format!(
        "CREATE TRIGGER ripple_changes_trg \
         AFTER INSERT OR UPDATE OR DELETE ON {source} \
         FOR EACH ROW EXECUTE FUNCTION ripple_record_change()"
    );
    sqlx::query(&create)
        .execute(pool)
        .await
        .with_context(|| format!("failed to create change trigger on {source}"))?;

    Ok(())
}
