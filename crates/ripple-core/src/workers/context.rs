//! The context value handed to task handlers.
//!
//! Exposes the locked record's identity and watched snapshot, the
//! optimistic-lock guarded document fetch, and the flow-control operations
//! (`defer_current`, `throttle_all`, `mark_completed`).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use ripple_db::queries::tasks::{self, RunOutcome};
use ripple_db::sql::bind_params_as;

use crate::registry::RegisteredTask;

/// Distinguished signal thrown by [`TaskContext::get_document`] when the
/// source document no longer satisfies the task predicate with the watched
/// snapshot intact. The worker treats it as success (skipped): a newer
/// planning already superseded this run.
#[derive(Debug, Error)]
#[error("task condition failed: source document no longer matches the watched snapshot")]
pub struct TaskConditionFailed;

/// A deferral target: a relative delay or an absolute instant.
#[derive(Debug, Clone, Copy)]
pub enum Defer {
    Delay(Duration),
    At(DateTime<Utc>),
}

impl Defer {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Delay(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
            }
            Self::At(at) => at,
        }
    }
}

impl From<Duration> for Defer {
    fn from(delay: Duration) -> Self {
        Self::Delay(delay)
    }
}

impl From<DateTime<Utc>> for Defer {
    fn from(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }
}

/// Flow-control requests accumulated during a handler run; the worker
/// reads them after the handler returns.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ContextOutcome {
    pub deferred: Option<DateTime<Utc>>,
    pub throttle_until: Option<DateTime<Utc>>,
    pub completed: bool,
}

struct Inner {
    pool: PgPool,
    task: Arc<RegisteredTask>,
    record_id: uuid::Uuid,
    source_doc_id: String,
    watched_values: Value,
    started_at: DateTime<Utc>,
    state: Mutex<ContextOutcome>,
}

/// Handler-facing API for one locked task record.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

impl TaskContext {
    pub(crate) fn new(
        pool: PgPool,
        task: Arc<RegisteredTask>,
        record: &ripple_db::models::TaskRecord,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                task,
                record_id: record.id,
                source_doc_id: record.source_doc_id.clone(),
                watched_values: record.last_observed.clone().unwrap_or(Value::Null),
                started_at: record.started_at.unwrap_or_else(Utc::now),
                state: Mutex::new(ContextOutcome::default()),
            }),
        }
    }

    /// Id of the source document this run is for.
    pub fn source_doc_id(&self) -> &str {
        &self.inner.source_doc_id
    }

    /// The watch-projection snapshot that triggered this planning.
    pub fn watched_values(&self) -> &Value {
        &self.inner.watched_values
    }

    /// Name of the task being executed.
    pub fn task_name(&self) -> &str {
        self.inner.task.name()
    }

    /// Fetch the source document under the optimistic-lock guard.
    ///
    /// The row must still satisfy the task predicate *and* its watch
    /// projection must still equal [`Self::watched_values`]. When no row
    /// matches, a [`TaskConditionFailed`] is returned: the document moved
    /// on and a follow-up run is (or will be) planned for the new state.
    pub async fn get_document(&self) -> Result<Value> {
        let inner = &self.inner;
        let predicate = inner.task.predicate.to_sql("s");
        let projection = inner.task.projection.to_sql("s");

        // $1 is the document id; predicate params follow; the watched
        // snapshot comes last.
        let watched_param = 2 + predicate.placeholder_count();
        let stmt = format!(
            "SELECT s.doc FROM {source} s \
             WHERE s.id = $1 \
               AND ({predicate}) \
               AND ({projection}) IS NOT DISTINCT FROM ${watched_param}",
            source = inner.task.source_table,
            predicate = predicate.numbered(2),
            projection = projection.text,
        );

        let query = sqlx::query_as::<_, (Value,)>(&stmt).bind(&inner.source_doc_id);
        let row = bind_params_as(query, &predicate.params)
            .bind(&inner.watched_values)
            .fetch_optional(&inner.pool)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch document {} from {}",
                    inner.source_doc_id, inner.task.source_table
                )
            })?;

        match row {
            Some((doc,)) => Ok(doc),
            None => Err(TaskConditionFailed.into()),
        }
    }

    /// Schedule this record to run again later instead of finalizing.
    ///
    /// Takes effect after the handler returns (unless `mark_completed` was
    /// called as well, which wins).
    pub fn defer_current(&self, when: impl Into<Defer>) {
        let until = when.into().resolve(Utc::now());
        self.inner.state.lock().unwrap().deferred = Some(until);
    }

    /// Postpone further polling of this task name until the given time.
    pub fn throttle_all(&self, until: impl Into<Defer>) {
        let until = until.into().resolve(Utc::now());
        self.inner.state.lock().unwrap().throttle_until = Some(until);
    }

    /// Finalize this run as successful immediately, against the pool.
    ///
    /// Idempotent: a second call (or the worker's own finalization) is a
    /// no-op.
    pub async fn mark_completed(&self) -> Result<()> {
        if self.already_completed() {
            return Ok(());
        }
        let inner = &self.inner;
        tasks::finalize_task(
            &inner.pool,
            &inner.task.tasks_table,
            inner.record_id,
            &self.success_outcome(),
            inner.task.debounce_ms(),
            inner.task.spec.execution_history_limit as i64,
            inner.task.spec.handler_version.as_deref(),
        )
        .await?;
        Ok(())
    }

    /// Finalize this run as successful inside the caller's transaction, so
    /// the handler's own writes and the task completion commit atomically.
    pub async fn mark_completed_in(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        if self.already_completed() {
            return Ok(());
        }
        let inner = &self.inner;
        tasks::finalize_task(
            &mut **tx,
            &inner.task.tasks_table,
            inner.record_id,
            &self.success_outcome(),
            inner.task.debounce_ms(),
            inner.task.spec.execution_history_limit as i64,
            inner.task.spec.handler_version.as_deref(),
        )
        .await?;
        Ok(())
    }

    /// Check-and-set the completed flag; true when already set.
    fn already_completed(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.completed {
            return true;
        }
        state.completed = true;
        false
    }

    fn success_outcome(&self) -> RunOutcome {
        let duration_ms = (Utc::now() - self.inner.started_at)
            .num_milliseconds()
            .max(0);
        RunOutcome::Success { duration_ms }
    }

    pub(crate) fn outcome(&self) -> ContextOutcome {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn record_id(&self) -> uuid::Uuid {
        self.inner.record_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_resolves_relative_and_absolute() {
        let now = Utc::now();
        let relative = Defer::from(Duration::from_millis(1500)).resolve(now);
        assert_eq!((relative - now).num_milliseconds(), 1500);

        let at = now + chrono::Duration::seconds(9);
        assert_eq!(Defer::from(at).resolve(now), at);
    }

    #[test]
    fn condition_failed_is_downcastable() {
        let err: anyhow::Error = TaskConditionFailed.into();
        assert!(err.is::<TaskConditionFailed>());
    }
}
