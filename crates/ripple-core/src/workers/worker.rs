//! Executes one locked task record to completion: lock renewal, handler
//! invocation through the optional middleware, and finalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ripple_db::models::TaskRecord;
use ripple_db::queries::tasks::{self, RunOutcome};
use ripple_db::queries::TableName;

use crate::events::{
    InfoEvent, Sinks, CODE_REACTIVE_TASK_FAILED, CODE_REACTIVE_TASK_FINISHED,
    CODE_REACTIVE_TASK_STARTED,
};
use crate::metrics::MetricsCollector;
use crate::registry::{HandlerFuture, RegisteredTask, Registry, TaskHandler};
use crate::workers::context::{TaskConditionFailed, TaskContext};
use crate::workers::throttle::ThrottleTable;

/// Middleware wrapped around every handler invocation. The default is
/// identity; deployments use it for tracing spans, auth contexts, etc.
pub type TaskCaller = Arc<dyn Fn(TaskContext, TaskHandler) -> HandlerFuture + Send + Sync>;

/// Identity task caller.
pub fn identity_caller() -> TaskCaller {
    Arc::new(|ctx, handler| handler(ctx))
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long a locked record stays invisible to other workers; renewed
    /// at a fifth of this interval while the handler runs.
    pub visibility_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Shared machinery for running locked records.
pub struct WorkerEngine {
    pool: PgPool,
    registry: Arc<Registry>,
    throttle: Arc<ThrottleTable>,
    sinks: Sinks,
    metrics: Arc<MetricsCollector>,
    task_caller: TaskCaller,
    options: WorkerOptions,
}

impl WorkerEngine {
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        throttle: Arc<ThrottleTable>,
        sinks: Sinks,
        metrics: Arc<MetricsCollector>,
        task_caller: TaskCaller,
        options: WorkerOptions,
    ) -> Self {
        Self {
            pool,
            registry,
            throttle,
            sinks,
            metrics,
            task_caller,
            options,
        }
    }

    /// Poll one source collection: lock at most one due record and run it.
    ///
    /// Returns `true` when a record was found (the caller should poll
    /// again soon, there may be more).
    pub async fn run_one(&self, collection: &str) -> bool {
        // Tasks on one source may use distinct tasks tables; group the
        // non-throttled candidates per table and poll each group.
        let tasks = self.registry.tasks_for_collection(collection);
        let candidates = self
            .throttle
            .filter_candidates(tasks.iter().map(|t| t.name().to_owned()).collect());

        let mut groups: HashMap<&TableName, Vec<String>> = HashMap::new();
        for task in &tasks {
            if candidates.iter().any(|name| name == task.name()) {
                groups
                    .entry(&task.tasks_table)
                    .or_default()
                    .push(task.name().to_owned());
            }
        }

        for (table, names) in groups {
            let locked = match tasks::find_and_lock_next(
                &self.pool,
                table,
                &names,
                self.options.visibility_timeout.as_millis() as i64,
            )
            .await
            {
                Ok(locked) => locked,
                Err(err) => {
                    // Transient store failure: report and let the next
                    // poll tick retry.
                    self.sinks.error(&err);
                    continue;
                }
            };

            if let Some(record) = locked {
                let table = table.clone();
                self.process(&table, record).await;
                return true;
            }
        }

        false
    }

    /// Run one locked record through the handler and finalize it.
    async fn process(&self, table: &TableName, record: TaskRecord) {
        let Some(task) = self.registry.get(&record.task) else {
            // Candidate names come from the registry, so this only happens
            // if the registry changed under us. Unlock the record for an
            // instance that knows the task.
            warn!(task = %record.task, "locked a record for an unregistered task");
            if let Err(err) = tasks::defer_task(&self.pool, table, record.id, Utc::now()).await {
                self.sinks.error(&err);
            }
            return;
        };

        self.sinks.info(InfoEvent::new(
            CODE_REACTIVE_TASK_STARTED,
            format!("reactive task {} started", task.name()),
            json!({
                "task": task.name(),
                "sourceDocId": record.source_doc_id,
                "attempt": record.attempts,
            }),
        ));

        let renewer = self.spawn_lock_renewer(&task, record.id);
        let ctx = TaskContext::new(self.pool.clone(), Arc::clone(&task), &record);
        let started = Utc::now();

        let result = (self.task_caller)(ctx.clone(), Arc::clone(&task.spec.handler)).await;

        renewer.cancel();

        let duration_ms = (Utc::now() - started).num_milliseconds().max(0);
        let outcome = ctx.outcome();

        if let Some(until) = outcome.throttle_until {
            self.throttle.throttle(task.name(), until);
        }

        match result {
            Err(err) if !err.is::<TaskConditionFailed>() => {
                self.sinks.error(&err);
                let attempts = record.attempts.max(1) as u32;
                let would_fail = task.spec.retry.should_fail(attempts, record.first_error_at);
                let run = RunOutcome::Failure {
                    error: format!("{err:#}"),
                    duration_ms,
                    would_fail,
                    retry_at: task.spec.retry.calculate_next_retry(attempts),
                };
                if let Err(finalize_err) = self.finalize(&task, ctx.record_id(), &run).await {
                    self.sinks.error(&finalize_err);
                }
                self.metrics.record_execution(task.name(), false, duration_ms);
                if !would_fail {
                    self.metrics.record_retry(task.name());
                }
                self.sinks.info(InfoEvent::new(
                    CODE_REACTIVE_TASK_FAILED,
                    format!("reactive task {} failed", task.name()),
                    json!({
                        "task": task.name(),
                        "sourceDocId": record.source_doc_id,
                        "attempt": record.attempts,
                        "durationMs": duration_ms,
                        "error": format!("{err:#}"),
                    }),
                ));
            }
            result => {
                // Normal return, or the optimistic-lock guard fired
                // (skipped counts as success).
                let skipped = result.is_err();
                if outcome.completed {
                    // mark_completed already finalized inside the handler.
                } else if let Some(until) = outcome.deferred {
                    if let Err(err) =
                        tasks::defer_task(&self.pool, &task.tasks_table, record.id, until).await
                    {
                        self.sinks.error(&err);
                    }
                } else {
                    let run = RunOutcome::Success { duration_ms };
                    if let Err(err) = self.finalize(&task, ctx.record_id(), &run).await {
                        self.sinks.error(&err);
                    }
                }
                self.metrics.record_execution(task.name(), true, duration_ms);
                self.sinks.info(InfoEvent::new(
                    CODE_REACTIVE_TASK_FINISHED,
                    format!("reactive task {} finished", task.name()),
                    json!({
                        "task": task.name(),
                        "sourceDocId": record.source_doc_id,
                        "durationMs": duration_ms,
                        "skipped": skipped,
                        "deferred": outcome.deferred.is_some(),
                    }),
                ));
            }
        }
    }

    async fn finalize(
        &self,
        task: &RegisteredTask,
        record_id: uuid::Uuid,
        run: &RunOutcome,
    ) -> Result<()> {
        tasks::finalize_task(
            &self.pool,
            &task.tasks_table,
            record_id,
            run,
            task.debounce_ms(),
            task.spec.execution_history_limit as i64,
            task.spec.handler_version.as_deref(),
        )
        .await?;
        Ok(())
    }

    /// Renew the visibility deadline every `visibility / 5` while the
    /// handler runs. Renewal failures are reported but never interrupt the
    /// handler; losing the lock means another instance may pick the record
    /// up after the deadline, which the finalization statements tolerate.
    fn spawn_lock_renewer(&self, task: &Arc<RegisteredTask>, record_id: uuid::Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pool = self.pool.clone();
        let table = task.tasks_table.clone();
        let sinks = self.sinks.clone();
        let visibility_ms = self.options.visibility_timeout.as_millis() as i64;
        let interval = self.options.visibility_timeout / 5;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match tasks::renew_lock(&pool, &table, record_id, visibility_ms).await {
                    Ok(0) => {
                        warn!(record_id = %record_id, "lock renewal found no in-flight record");
                    }
                    Ok(_) => {}
                    Err(err) => sinks.error(&err),
                }
            }
        });

        cancel
    }
}
