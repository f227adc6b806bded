//! Query functions for the per-source tasks tables.
//!
//! Every function takes the tasks table as a validated [`TableName`]; the
//! table layout is provisioned by [`super::schema::ensure_tasks_table`].
//! Lock acquisition and finalization are single statements so concurrent
//! workers and the planning pipeline interleave safely.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::models::{
    CleanupMode, ExecutionEntry, Paging, TaskFilter, TaskRecord, TaskStatistics, TaskStatus,
};
use crate::sql::{bind_params, bind_params_as, Sql, SqlParam};

use super::TableName;

/// Outcome of one handler run, as seen by [`finalize_task`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The handler returned normally (or was skipped by the optimistic
    /// lock guard).
    Success { duration_ms: i64 },
    /// The handler failed. `would_fail` and `retry_at` are the retry
    /// strategy's decision, computed by the caller from the locked record.
    Failure {
        error: String,
        duration_ms: i64,
        would_fail: bool,
        retry_at: DateTime<Utc>,
    },
}

/// Atomically lock the next due record among `tasks`.
///
/// Selects the smallest-`next_run_at` record with `next_run_at <= now()`
/// using `FOR UPDATE SKIP LOCKED`, moves it to `processing` with the
/// visibility deadline, stamps `started_at`, and increments `attempts`.
/// Returns the updated record, or `None` when nothing is due.
pub async fn find_and_lock_next(
    pool: &PgPool,
    table: &TableName,
    tasks: &[String],
    visibility_timeout_ms: i64,
) -> Result<Option<TaskRecord>> {
    let stmt = format!(
        "WITH candidate AS ( \
             SELECT id FROM {table} \
             WHERE task = ANY($1) AND next_run_at <= now() \
             ORDER BY next_run_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE {table} AS t SET \
             status = 'processing', \
             next_run_at = now() + $2 * interval '1 millisecond', \
             started_at = now(), \
             attempts = t.attempts + 1, \
             updated_at = now() \
         FROM candidate \
         WHERE t.id = candidate.id \
         RETURNING t.*"
    );

    let record = sqlx::query_as::<_, TaskRecord>(&stmt)
        .bind(tasks)
        .bind(visibility_timeout_ms)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to lock next task in {table}"))?;

    Ok(record)
}

/// Finalize a run in a single update branched on the record's *current*
/// status.
///
/// If the planner flipped the record to `processing_dirty` while the
/// handler ran, the record goes back to `pending` at `updated_at +
/// debounce` and error fields are preserved, so the follow-up run keeps
/// its provenance. Otherwise success completes the record and clears the
/// error fields, and failure either parks it as `failed` or reschedules it
/// at the strategy-computed time. One execution-history entry is appended
/// and the array is clamped to `history_limit`.
///
/// Generic over the executor so `mark_completed` can run inside a caller's
/// transaction.
#[allow(clippy::too_many_arguments)]
pub async fn finalize_task<'e, E>(
    executor: E,
    table: &TableName,
    record_id: Uuid,
    outcome: &RunOutcome,
    debounce_ms: i64,
    history_limit: i64,
    handler_version: Option<&str>,
) -> Result<TaskRecord>
where
    E: Executor<'e, Database = Postgres>,
{
    let now = Utc::now();
    let (success, would_fail, retry_at, error, duration_ms) = match outcome {
        RunOutcome::Success { duration_ms } => (true, false, now, None, *duration_ms),
        RunOutcome::Failure {
            error,
            duration_ms,
            would_fail,
            retry_at,
        } => (false, *would_fail, *retry_at, Some(error.clone()), *duration_ms),
    };

    let entry = ExecutionEntry {
        at: now,
        status: if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        },
        duration_ms,
        error: error.clone(),
    };
    let entry_json = serde_json::to_value(&entry).context("failed to encode history entry")?;
    let last_success = json!({ "at": now, "duration_ms": duration_ms });

    let stmt = format!(
        "UPDATE {table} SET \
             status = CASE \
                 WHEN status = 'processing_dirty' THEN 'pending' \
                 WHEN $2 THEN 'completed' \
                 WHEN $3 THEN 'failed' \
                 ELSE 'pending' \
             END, \
             next_run_at = CASE \
                 WHEN status = 'processing_dirty' \
                     THEN updated_at + $4 * interval '1 millisecond' \
                 WHEN $2 OR $3 THEN NULL \
                 ELSE $5 \
             END, \
             completed_at = CASE \
                 WHEN status <> 'processing_dirty' AND $2 THEN now() \
                 ELSE completed_at \
             END, \
             last_success = CASE WHEN $2 THEN $6 ELSE last_success END, \
             first_error_at = CASE \
                 WHEN status = 'processing_dirty' THEN first_error_at \
                 WHEN $2 THEN NULL \
                 ELSE COALESCE(first_error_at, now()) \
             END, \
             last_error = CASE \
                 WHEN status = 'processing_dirty' THEN COALESCE($7, last_error) \
                 WHEN $2 THEN NULL \
                 ELSE $7 \
             END, \
             handler_version = CASE WHEN $2 THEN $8 ELSE handler_version END, \
             execution_history = ( \
                 SELECT COALESCE(jsonb_agg(h.entry ORDER BY h.ord), '[]'::jsonb) \
                 FROM jsonb_array_elements( \
                     execution_history || jsonb_build_array($9::jsonb) \
                 ) WITH ORDINALITY AS h(entry, ord) \
                 WHERE h.ord > jsonb_array_length( \
                     execution_history || jsonb_build_array($9::jsonb) \
                 ) - $10 \
             ), \
             last_finalized_at = now(), \
             updated_at = now() \
         WHERE id = $1 \
         RETURNING *"
    );

    let record = sqlx::query_as::<_, TaskRecord>(&stmt)
        .bind(record_id)
        .bind(success)
        .bind(would_fail)
        .bind(debounce_ms)
        .bind(retry_at)
        .bind(if success { Some(&last_success) } else { None })
        .bind(error)
        .bind(handler_version)
        .bind(&entry_json)
        .bind(history_limit)
        .fetch_one(executor)
        .await
        .with_context(|| format!("failed to finalize task record {record_id} in {table}"))?;

    Ok(record)
}

/// Defer a record to a later time, bypassing finalization.
///
/// Resets `attempts` to 0 and preserves `due_at` so lag metrics keep the
/// original schedule.
pub async fn defer_task(
    pool: &PgPool,
    table: &TableName,
    record_id: Uuid,
    until: DateTime<Utc>,
) -> Result<()> {
    let stmt = format!(
        "UPDATE {table} SET \
             status = 'pending', \
             next_run_at = $2, \
             attempts = 0, \
             updated_at = now() \
         WHERE id = $1"
    );

    sqlx::query(&stmt)
        .bind(record_id)
        .bind(until)
        .execute(pool)
        .await
        .with_context(|| format!("failed to defer task record {record_id} in {table}"))?;

    Ok(())
}

/// Advance the visibility deadline of a locked record.
///
/// Matches both in-flight statuses so a record flipped to
/// `processing_dirty` mid-run keeps its lock window. Returns the number of
/// rows renewed (0 means the lock was lost).
pub async fn renew_lock(
    pool: &PgPool,
    table: &TableName,
    record_id: Uuid,
    visibility_timeout_ms: i64,
) -> Result<u64> {
    let stmt = format!(
        "UPDATE {table} SET \
             next_run_at = now() + $2 * interval '1 millisecond' \
         WHERE id = $1 AND status IN ('processing', 'processing_dirty')"
    );

    let result = sqlx::query(&stmt)
        .bind(record_id)
        .bind(visibility_timeout_ms)
        .execute(pool)
        .await
        .with_context(|| format!("failed to renew lock on {record_id} in {table}"))?;

    Ok(result.rows_affected())
}

/// Build the WHERE fragment for a [`TaskFilter`] against an unaliased
/// tasks table.
fn filter_sql(filter: &TaskFilter) -> Sql {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(task) = &filter.task {
        clauses.push("task = ?".to_owned());
        params.push(SqlParam::Text(task.clone()));
    }
    if !filter.statuses.is_empty() {
        clauses.push("status = ANY(?)".to_owned());
        params.push(SqlParam::TextArray(
            filter.statuses.iter().map(ToString::to_string).collect(),
        ));
    }
    if let Some(id) = &filter.source_doc_id {
        clauses.push("source_doc_id = ?".to_owned());
        params.push(SqlParam::Text(id.clone()));
    }
    if let Some(needle) = &filter.error_message {
        clauses.push("last_error ILIKE '%' || ? || '%'".to_owned());
        params.push(SqlParam::Text(needle.clone()));
    }
    match filter.has_error {
        Some(true) => clauses.push("last_error IS NOT NULL".to_owned()),
        Some(false) => clauses.push("last_error IS NULL".to_owned()),
        None => {}
    }

    let text = if clauses.is_empty() {
        "TRUE".to_owned()
    } else {
        clauses.join(" AND ")
    };
    Sql { text, params }
}

/// Reset matching records so they run again.
///
/// Records currently `processing` only move to `processing_dirty` (the
/// lock window is preserved and the worker's finalization schedules the
/// follow-up); everything else becomes `pending` due now. Attempts,
/// history, and error fields are preserved. Returns the number of records
/// touched.
pub async fn reset_tasks(pool: &PgPool, table: &TableName, filter: &TaskFilter) -> Result<u64> {
    let where_sql = filter_sql(filter);
    let stmt = format!(
        "UPDATE {table} SET \
             status = CASE \
                 WHEN status IN ('processing', 'processing_dirty') THEN 'processing_dirty' \
                 ELSE 'pending' \
             END, \
             next_run_at = CASE \
                 WHEN status IN ('processing', 'processing_dirty') THEN next_run_at \
                 ELSE now() \
             END, \
             updated_at = now() \
         WHERE {}",
        where_sql.numbered(1)
    );

    let result = bind_params(sqlx::query(&stmt), &where_sql.params)
        .execute(pool)
        .await
        .with_context(|| format!("failed to reset tasks in {table}"))?;

    Ok(result.rows_affected())
}

/// List task records matching a filter, newest first.
pub async fn list_tasks(
    pool: &PgPool,
    table: &TableName,
    filter: &TaskFilter,
    paging: Paging,
) -> Result<Vec<TaskRecord>> {
    let where_sql = filter_sql(filter);
    let next = where_sql.placeholder_count() + 1;
    let stmt = format!(
        "SELECT * FROM {table} WHERE {} \
         ORDER BY created_at DESC, id \
         LIMIT ${next} OFFSET ${}",
        where_sql.numbered(1),
        next + 1,
    );

    let records = bind_params_as(sqlx::query_as::<_, TaskRecord>(&stmt), &where_sql.params)
        .bind(paging.limit)
        .bind(paging.offset)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to list tasks in {table}"))?;

    Ok(records)
}

/// Count task records matching a filter.
pub async fn count_tasks(pool: &PgPool, table: &TableName, filter: &TaskFilter) -> Result<i64> {
    let where_sql = filter_sql(filter);
    let stmt = format!(
        "SELECT COUNT(*) FROM {table} WHERE {}",
        where_sql.numbered(1)
    );

    let row = bind_params(sqlx::query(&stmt), &where_sql.params)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count tasks in {table}"))?;

    let count: i64 = sqlx::Row::get(&row, 0);
    Ok(count)
}

/// Fetch one record by `(task, source_doc_id)`.
pub async fn get_by_source(
    pool: &PgPool,
    table: &TableName,
    task: &str,
    source_doc_id: &str,
) -> Result<Option<TaskRecord>> {
    let stmt = format!("SELECT * FROM {table} WHERE task = $1 AND source_doc_id = $2");

    let record = sqlx::query_as::<_, TaskRecord>(&stmt)
        .bind(task)
        .bind(source_doc_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch task record in {table}"))?;

    Ok(record)
}

/// Per-task status counts, error counts, and oldest pending `due_at`, in
/// one grouped query.
pub async fn get_statistics(
    pool: &PgPool,
    table: &TableName,
    filter: &TaskFilter,
) -> Result<Vec<TaskStatistics>> {
    let where_sql = filter_sql(filter);
    let stmt = format!(
        "SELECT task, status, COUNT(*) AS count, \
                COUNT(last_error) AS with_error, \
                MIN(due_at) FILTER (WHERE status = 'pending') AS oldest_due \
         FROM {table} WHERE {} \
         GROUP BY task, status \
         ORDER BY task",
        where_sql.numbered(1)
    );

    let rows = bind_params(sqlx::query(&stmt), &where_sql.params)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to gather statistics for {table}"))?;

    let mut stats: Vec<TaskStatistics> = Vec::new();
    for row in rows {
        use sqlx::Row;
        let task: String = row.get("task");
        let status: TaskStatus = row.get("status");
        let count: i64 = row.get("count");
        let with_error: i64 = row.get("with_error");
        let oldest_due: Option<DateTime<Utc>> = row.get("oldest_due");

        let entry = match stats.iter_mut().find(|s| s.task == task) {
            Some(entry) => entry,
            None => {
                stats.push(TaskStatistics {
                    task,
                    ..Default::default()
                });
                stats.last_mut().unwrap()
            }
        };
        match status {
            TaskStatus::Pending => entry.pending = count,
            TaskStatus::Processing => entry.processing = count,
            TaskStatus::ProcessingDirty => entry.processing_dirty = count,
            TaskStatus::Completed => entry.completed = count,
            TaskStatus::Failed => entry.failed = count,
        }
        entry.with_error += with_error;
        entry.oldest_due = match (entry.oldest_due, oldest_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    Ok(stats)
}

/// Delete orphaned task records for one task, in batches of
/// [`ORPHAN_BATCH_SIZE`].
///
/// A record is orphaned when it is older than `keep_for_ms` (measured from
/// the max of `updated_at` and `last_finalized_at`/`created_at`) and its
/// source row is gone, or, under
/// [`CleanupMode::SourceDocumentDeletedOrNoLongerMatching`], no longer
/// satisfies the task predicate. `predicate` must be compiled against the
/// alias `s`. `should_stop` is consulted between batches. Returns the
/// number of deleted records.
#[allow(clippy::too_many_arguments)]
pub async fn delete_orphaned(
    pool: &PgPool,
    table: &TableName,
    source: &TableName,
    task: &str,
    mode: CleanupMode,
    predicate: &Sql,
    keep_for_ms: i64,
    should_stop: impl Fn() -> bool,
    limit_source_ids: Option<&[String]>,
) -> Result<u64> {
    if mode == CleanupMode::Never {
        return Ok(0);
    }

    let orphan_condition = match mode {
        CleanupMode::Never => unreachable!(),
        CleanupMode::SourceDocumentDeleted => "s.id IS NULL".to_owned(),
        CleanupMode::SourceDocumentDeletedOrNoLongerMatching => {
            // Predicate params start after task ($1), keep_for ($2), and
            // the optional id restriction.
            let offset = if limit_source_ids.is_some() { 4 } else { 3 };
            format!("s.id IS NULL OR NOT ({})", predicate.numbered(offset))
        }
    };
    let id_restriction = if limit_source_ids.is_some() {
        "AND t.source_doc_id = ANY($3)"
    } else {
        ""
    };

    let select_stmt = format!(
        "SELECT t.id FROM {table} t \
         LEFT JOIN {source} s ON s.id = t.source_doc_id \
         WHERE t.task = $1 \
           AND GREATEST(t.updated_at, COALESCE(t.last_finalized_at, t.created_at)) \
               < now() - $2 * interval '1 millisecond' \
           {id_restriction} \
           AND ({orphan_condition}) \
         LIMIT {ORPHAN_BATCH_SIZE}"
    );
    let delete_stmt = format!("DELETE FROM {table} WHERE id = ANY($1)");

    let outcome = crate::batch::process_in_batches(
        || async {
            let mut query = sqlx::query_scalar::<_, Uuid>(&select_stmt)
                .bind(task)
                .bind(keep_for_ms);
            if let Some(ids) = limit_source_ids {
                query = query.bind(ids);
            }
            if mode == CleanupMode::SourceDocumentDeletedOrNoLongerMatching {
                for param in &predicate.params {
                    query = match param {
                        SqlParam::Json(v) => query.bind(v),
                        SqlParam::Text(s) => query.bind(s),
                        SqlParam::TextArray(a) => query.bind(a),
                        SqlParam::Int(i) => query.bind(i),
                        SqlParam::Float(f) => query.bind(f),
                        SqlParam::Bool(b) => query.bind(b),
                    };
                }
            }
            query
                .fetch_all(pool)
                .await
                .with_context(|| format!("failed to select orphaned records in {table}"))
        },
        |ids: Vec<Uuid>| {
            let delete_stmt = delete_stmt.clone();
            async move {
            let result = sqlx::query(&delete_stmt)
                .bind(&ids)
                .execute(pool)
                .await
                .with_context(|| format!("failed to delete orphaned records in {table}"))?;
            Ok(result.rows_affected())
            }
        },
        &should_stop,
    )
    .await?;

    Ok(outcome.operations_performed)
}

/// Batch size for orphan deletion.
pub const ORPHAN_BATCH_SIZE: i64 = 1000;

/// Reset records for one task according to a handler-version change
/// policy: `failed` only, or `completed` and `failed`.
///
/// Only records whose recorded `handler_version` differs from
/// `current_version` are touched. Returns the number of reset records.
pub async fn reprocess_for_version_change(
    pool: &PgPool,
    table: &TableName,
    task: &str,
    current_version: &str,
    include_completed: bool,
) -> Result<u64> {
    let statuses: &[&str] = if include_completed {
        &["completed", "failed"]
    } else {
        &["failed"]
    };
    let statuses: Vec<String> = statuses.iter().map(|s| (*s).to_owned()).collect();

    let stmt = format!(
        "UPDATE {table} SET \
             status = 'pending', \
             next_run_at = now(), \
             updated_at = now() \
         WHERE task = $1 \
           AND status = ANY($2) \
           AND handler_version IS DISTINCT FROM $3"
    );

    let result = sqlx::query(&stmt)
        .bind(task)
        .bind(&statuses)
        .bind(current_version)
        .execute(pool)
        .await
        .with_context(|| format!("failed to reprocess records for {task} in {table}"))?;

    Ok(result.rows_affected())
}
