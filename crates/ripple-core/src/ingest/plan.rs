//! The planning statement: one upsert-merge per (task, document batch).
//!
//! For each affected source document that satisfies the task predicate,
//! the statement inserts a pending task record or, when a record already
//! exists, applies the in-store merge pipeline: a changed watch snapshot
//! while the record is in flight forces `processing_dirty` (exactly one
//! follow-up run after the current one), a changed snapshot otherwise
//! reschedules the record at the debounced time, and an unchanged
//! snapshot leaves the record alone.

use anyhow::{Context, Result};
use sqlx::PgPool;

use ripple_db::sql::bind_params;

use crate::registry::RegisteredTask;

/// Plan the given source documents for one task.
///
/// `force` bypasses the changed-snapshot check (manual triggers): the
/// record is rescheduled to run now even when the watched values are
/// unchanged. Returns the number of task records written.
pub async fn plan_documents(
    pool: &PgPool,
    task: &RegisteredTask,
    doc_ids: &[String],
    force: bool,
) -> Result<u64> {
    if doc_ids.is_empty() {
        return Ok(0);
    }

    let predicate = task.predicate.to_sql("s");
    let projection = task.projection.to_sql("s");

    // $1 task name, $2 debounce, $3 ids; predicate params follow.
    let changed = "t.last_observed IS DISTINCT FROM EXCLUDED.last_observed";
    let in_flight = "t.status IN ('processing', 'processing_dirty')";
    let reset_errors = if task.spec.reset_retries_on_data_change {
        "TRUE"
    } else {
        "FALSE"
    };
    let (update_when, scheduled) = if force {
        ("TRUE", "now()")
    } else {
        (changed, "EXCLUDED.next_run_at")
    };

    let stmt = format!(
        "INSERT INTO {tasks} AS t \
             (task, source_doc_id, status, attempts, last_observed, \
              next_run_at, due_at, created_at, updated_at) \
         SELECT $1, s.id, 'pending', 0, {projection}, \
                now() + $2 * interval '1 millisecond', \
                now() + $2 * interval '1 millisecond', \
                now(), now() \
         FROM {source} s \
         WHERE s.id = ANY($3) AND ({predicate}) \
         ON CONFLICT (source_doc_id, task) DO UPDATE SET \
             status = CASE WHEN {update_when} THEN \
                 CASE WHEN {in_flight} THEN 'processing_dirty' ELSE 'pending' END \
             ELSE t.status END, \
             next_run_at = CASE WHEN {update_when} THEN \
                 CASE WHEN {in_flight} THEN t.next_run_at ELSE {scheduled} END \
             ELSE t.next_run_at END, \
             due_at = CASE WHEN {update_when} THEN EXCLUDED.due_at ELSE t.due_at END, \
             attempts = CASE WHEN {update_when} THEN 0 ELSE t.attempts END, \
             first_error_at = CASE WHEN {update_when} AND {reset_errors} \
                 THEN NULL ELSE t.first_error_at END, \
             last_error = CASE WHEN {update_when} AND {reset_errors} \
                 THEN NULL ELSE t.last_error END, \
             last_observed = EXCLUDED.last_observed, \
             updated_at = CASE WHEN {update_when} THEN now() ELSE t.updated_at END",
        tasks = task.tasks_table,
        source = task.source_table,
        projection = projection.text,
        predicate = predicate.numbered(4),
    );

    // Manual triggers schedule immediately, without the debounce.
    let debounce_ms = if force { 0 } else { task.debounce_ms() };
    let ids: Vec<String> = doc_ids.to_vec();
    let query = sqlx::query(&stmt)
        .bind(task.name())
        .bind(debounce_ms)
        .bind(&ids);

    let result = bind_params(query, &predicate.params)
        .execute(pool)
        .await
        .with_context(|| format!("failed to plan documents for task {}", task.name()))?;

    Ok(result.rows_affected())
}

/// Fetch the next batch of source document ids beyond `after_id`, in id
/// order (the reconciliation scan).
pub async fn fetch_source_id_batch(
    pool: &PgPool,
    task: &RegisteredTask,
    after_id: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let stmt = format!(
        "SELECT id FROM {source} WHERE id > $1 ORDER BY id ASC LIMIT $2",
        source = task.source_table,
    );

    let ids: Vec<String> = sqlx::query_scalar(&stmt)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to scan {} for reconciliation", task.source_table))?;

    Ok(ids)
}
