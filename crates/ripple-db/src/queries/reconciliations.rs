//! Query functions for per-task reconciliation state.
//!
//! A task's reconciliation row carries the completion flag, the trigger
//! signature it was computed for, the ordered-scan checkpoint, and the
//! last seen handler version (for evolution policies).

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ReconciliationRow;

/// Fetch the reconciliation row for a task.
pub async fn get(pool: &PgPool, task: &str) -> Result<Option<ReconciliationRow>> {
    let row = sqlx::query_as::<_, ReconciliationRow>(
        "SELECT task, collection, signature, completed, checkpoint_id, \
                handler_version, updated_at \
         FROM reconciliations WHERE task = $1",
    )
    .bind(task)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to read reconciliation state for {task}"))?;

    Ok(row)
}

/// Ensure a pending reconciliation exists for `task` under `signature`.
///
/// First registration inserts a pending row. A signature change resets the
/// row to pending with a cleared checkpoint (the scan restarts at zero).
/// An unchanged signature leaves the row alone, so an interrupted scan
/// resumes from its checkpoint. Returns `true` when a reconciliation is
/// now pending.
pub async fn ensure(
    pool: &PgPool,
    task: &str,
    collection: &str,
    signature: &str,
    handler_version: Option<&str>,
) -> Result<bool> {
    let row = sqlx::query_as::<_, ReconciliationRow>(
        "INSERT INTO reconciliations \
             (task, collection, signature, completed, checkpoint_id, handler_version) \
         VALUES ($1, $2, $3, FALSE, NULL, $4) \
         ON CONFLICT (task) DO UPDATE SET \
             collection = EXCLUDED.collection, \
             signature = EXCLUDED.signature, \
             completed = CASE \
                 WHEN reconciliations.signature <> EXCLUDED.signature THEN FALSE \
                 ELSE reconciliations.completed \
             END, \
             checkpoint_id = CASE \
                 WHEN reconciliations.signature <> EXCLUDED.signature THEN NULL \
                 ELSE reconciliations.checkpoint_id \
             END, \
             handler_version = EXCLUDED.handler_version, \
             updated_at = now() \
         RETURNING task, collection, signature, completed, checkpoint_id, \
                   handler_version, updated_at",
    )
    .bind(task)
    .bind(collection)
    .bind(signature)
    .bind(handler_version)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to ensure reconciliation for {task}"))?;

    Ok(!row.completed)
}

/// Record a new signature without flagging a re-scan, for tasks that opt
/// out of reconciliation on trigger changes. Inserts a completed row when
/// none exists.
pub async fn set_signature(
    pool: &PgPool,
    task: &str,
    collection: &str,
    signature: &str,
    handler_version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO reconciliations \
             (task, collection, signature, completed, checkpoint_id, handler_version) \
         VALUES ($1, $2, $3, TRUE, NULL, $4) \
         ON CONFLICT (task) DO UPDATE SET \
             collection = EXCLUDED.collection, \
             signature = EXCLUDED.signature, \
             handler_version = EXCLUDED.handler_version, \
             updated_at = now()",
    )
    .bind(task)
    .bind(collection)
    .bind(signature)
    .bind(handler_version)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record signature for {task}"))?;

    Ok(())
}

/// Flag a task for a full re-scan (used when change history was pruned
/// beyond the persisted cursor). Clears the checkpoint: a history gap
/// invalidates any partial scan.
pub async fn flag_gap(pool: &PgPool, task: &str) -> Result<()> {
    sqlx::query(
        "UPDATE reconciliations \
         SET completed = FALSE, checkpoint_id = NULL, updated_at = now() \
         WHERE task = $1",
    )
    .bind(task)
    .execute(pool)
    .await
    .with_context(|| format!("failed to flag reconciliation gap for {task}"))?;

    Ok(())
}

/// Advance the ordered-scan checkpoint.
pub async fn set_checkpoint(pool: &PgPool, task: &str, last_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE reconciliations \
         SET checkpoint_id = $2, updated_at = now() \
         WHERE task = $1",
    )
    .bind(task)
    .bind(last_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to advance reconciliation checkpoint for {task}"))?;

    Ok(())
}

/// Mark a task's reconciliation complete and clear the checkpoint.
pub async fn complete(pool: &PgPool, task: &str) -> Result<()> {
    sqlx::query(
        "UPDATE reconciliations \
         SET completed = TRUE, checkpoint_id = NULL, updated_at = now() \
         WHERE task = $1",
    )
    .bind(task)
    .execute(pool)
    .await
    .with_context(|| format!("failed to complete reconciliation for {task}"))?;

    Ok(())
}

/// All tasks with a pending reconciliation, oldest first.
pub async fn list_pending(pool: &PgPool) -> Result<Vec<ReconciliationRow>> {
    let rows = sqlx::query_as::<_, ReconciliationRow>(
        "SELECT task, collection, signature, completed, checkpoint_id, \
                handler_version, updated_at \
         FROM reconciliations WHERE NOT completed \
         ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending reconciliations")?;

    Ok(rows)
}
