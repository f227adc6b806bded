//! Leader-side planning: change ingestion, reconciliation, and cleanup.
//!
//! Exactly one instance (the leader) runs a [`Planner`]. It drains the
//! trigger-fed change log into planning statements, persists resume
//! cursors, re-scans source tables when a task is new, its trigger
//! signature changed, or change history was lost, and periodically deletes
//! orphaned task records and prunes the change log.

pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ripple_db::models::{CleanupMode, VersionChangePolicy};
use ripple_db::queries::{changes, cursors, metrics as metrics_db, reconciliations, tasks};

use crate::events::{
    InfoEvent, Sinks, CODE_REACTIVE_TASK_CLEANUP, CODE_REACTIVE_TASK_PLANNER_STARTED,
    CODE_REACTIVE_TASK_RECONCILIATION_FINISHED, CODE_REACTIVE_TASK_RECONCILIATION_STARTED,
    CODE_REACTIVE_TASK_STREAM_ERROR,
};
use crate::metrics::{MetricsCollector, METRICS_STALENESS};
use crate::registry::{RegisteredTask, Registry};
use crate::workers::pool::AdaptiveRunner;

/// The LISTEN channel fed by the change-recording trigger.
const CHANGE_CHANNEL: &str = "ripple_changes";

/// Planner tuning.
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Fallback polling interval for the change log; NOTIFY wakeups make
    /// the usual latency much lower.
    pub change_poll_interval: Duration,
    /// Maximum change rows drained per statement round.
    pub change_batch_size: i64,
    /// Change-log rows older than this are pruned by the leader. A resume
    /// cursor that falls behind the pruned boundary is a history gap.
    pub change_retention: Duration,
    /// How often the orphan/prune cycle runs.
    pub cleanup_interval: Duration,
    /// Documents per reconciliation scan batch.
    pub reconcile_batch_size: i64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            change_poll_interval: Duration::from_millis(500),
            change_batch_size: 500,
            change_retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            reconcile_batch_size: 500,
        }
    }
}

/// The leader's planning engine.
pub struct Planner {
    pool: PgPool,
    registry: Arc<Registry>,
    runner: Arc<AdaptiveRunner>,
    sinks: Sinks,
    metrics: Arc<MetricsCollector>,
    options: PlannerOptions,
}

impl Planner {
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        runner: Arc<AdaptiveRunner>,
        sinks: Sinks,
        metrics: Arc<MetricsCollector>,
        options: PlannerOptions,
    ) -> Self {
        Self {
            pool,
            registry,
            runner,
            sinks,
            metrics,
            options,
        }
    }

    /// Run until cancelled (leadership loss or shutdown) or until a store
    /// error makes continuing unsafe. The caller surrenders leadership on
    /// `Err` so the next leader reopens the stream.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.sinks.info(InfoEvent::new(
            CODE_REACTIVE_TASK_PLANNER_STARTED,
            "planner started",
            json!({ "tasks": self.registry.all().len() }),
        ));

        self.startup().await?;
        self.reconcile_pending(&cancel).await?;

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open change listener")?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .context("failed to LISTEN on the change channel")?;

        let mut resume: HashMap<String, i64> = HashMap::new();
        let mut cleanup_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.options.cleanup_interval,
            self.options.cleanup_interval,
        );
        cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.drain_changes(&mut resume).await?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                notification = listener.recv() => {
                    match notification {
                        Ok(n) => debug!(collection = n.payload(), "change notification"),
                        Err(err) => {
                            let err = anyhow!(err).context("change listener failed");
                            self.sinks.info(InfoEvent::new(
                                CODE_REACTIVE_TASK_STREAM_ERROR,
                                "change stream error",
                                json!({ "error": format!("{err:#}") }),
                            ));
                            return Err(err);
                        }
                    }
                }
                _ = tokio::time::sleep(self.options.change_poll_interval) => {}
                _ = cleanup_tick.tick() => {
                    self.cleanup_cycle(&cancel).await?;
                }
            }
        }
    }

    /// Registration-time state sync: evolution policies, reconciliation
    /// flags, cursor initialization, startup gap detection.
    async fn startup(&self) -> Result<()> {
        for task in self.registry.all() {
            let prior = reconciliations::get(&self.pool, task.name()).await?;

            // Handler-version evolution runs before the signature update so
            // the recorded prior version is the one being migrated from.
            if let (Some(prior_row), Some(current)) = (&prior, &task.spec.handler_version) {
                if prior_row.handler_version.as_deref() != Some(current.as_str()) {
                    let include_completed = match task.spec.on_handler_version_change {
                        VersionChangePolicy::None => None,
                        VersionChangePolicy::ReprocessFailed => Some(false),
                        VersionChangePolicy::ReprocessAll => Some(true),
                    };
                    if let Some(include_completed) = include_completed {
                        let reset = tasks::reprocess_for_version_change(
                            &self.pool,
                            &task.tasks_table,
                            task.name(),
                            current,
                            include_completed,
                        )
                        .await?;
                        if reset > 0 {
                            info!(
                                task = task.name(),
                                reset, "handler version changed, reset records for reprocessing"
                            );
                            self.runner.speed_up(&task.spec.source_collection);
                        }
                    }
                }
            }

            match &prior {
                None => {
                    // First registration in the cluster.
                    reconciliations::ensure(
                        &self.pool,
                        task.name(),
                        &task.spec.source_collection,
                        &task.signature,
                        task.spec.handler_version.as_deref(),
                    )
                    .await?;
                }
                Some(prior_row) if prior_row.signature != task.signature => {
                    if task.spec.reconcile_on_trigger_change {
                        reconciliations::ensure(
                            &self.pool,
                            task.name(),
                            &task.spec.source_collection,
                            &task.signature,
                            task.spec.handler_version.as_deref(),
                        )
                        .await?;
                    } else {
                        reconciliations::set_signature(
                            &self.pool,
                            task.name(),
                            &task.spec.source_collection,
                            &task.signature,
                            task.spec.handler_version.as_deref(),
                        )
                        .await?;
                    }
                }
                Some(_) => {}
            }
        }

        for collection in self.registry.collections() {
            match cursors::get(&self.pool, &collection).await? {
                None => {
                    // Start from the present; reconciliation covers history.
                    let latest = changes::latest_seq(&self.pool, &collection).await?;
                    cursors::set(&self.pool, &collection, latest).await?;
                }
                Some(cursor) => {
                    let min = changes::min_seq(&self.pool, &collection).await?;
                    if let Some(min) = min {
                        if cursor < min - 1 {
                            self.flag_history_gap(&collection, cursor, min).await?;
                            let latest = changes::latest_seq(&self.pool, &collection).await?;
                            cursors::set(&self.pool, &collection, latest).await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Mark every task of a collection for a full re-scan after lost
    /// change history.
    async fn flag_history_gap(&self, collection: &str, cursor: i64, boundary: i64) -> Result<()> {
        warn!(
            collection,
            cursor, boundary, "change history lost beyond the resume cursor"
        );
        self.sinks.info(InfoEvent::new(
            CODE_REACTIVE_TASK_STREAM_ERROR,
            format!("change history lost for {collection}"),
            json!({ "collection": collection, "cursor": cursor, "boundary": boundary }),
        ));
        for task in self.registry.tasks_for_collection(collection) {
            reconciliations::flag_gap(&self.pool, task.name()).await?;
        }
        Ok(())
    }

    /// Drain the change log for every collection beyond its cursor,
    /// planning affected documents and persisting cursors per batch.
    async fn drain_changes(&self, resume: &mut HashMap<String, i64>) -> Result<()> {
        for collection in self.registry.collections() {
            let cursor = match resume.get(&collection) {
                Some(cursor) => *cursor,
                None => cursors::get(&self.pool, &collection).await?.unwrap_or(0),
            };
            let mut cursor = cursor;

            loop {
                let batch = changes::fetch_batch(
                    &self.pool,
                    &collection,
                    cursor,
                    self.options.change_batch_size,
                )
                .await?;
                if batch.is_empty() {
                    break;
                }

                let drained = batch.len() as i64;
                let last = batch.last().expect("non-empty batch");
                let last_seq = last.seq;
                let lag_ms = (chrono::Utc::now() - last.occurred_at)
                    .num_milliseconds()
                    .max(0);

                let mut upserted: Vec<String> = Vec::new();
                let mut deleted: Vec<String> = Vec::new();
                for row in &batch {
                    let bucket = match row.op {
                        ripple_db::models::ChangeOp::Delete => &mut deleted,
                        _ => &mut upserted,
                    };
                    if !bucket.contains(&row.doc_id) {
                        bucket.push(row.doc_id.clone());
                    }
                }

                let mut planned = 0;
                for task in self.registry.tasks_for_collection(&collection) {
                    if !upserted.is_empty() {
                        planned += plan::plan_documents(&self.pool, &task, &upserted, false).await?;
                    }
                    if !deleted.is_empty() && task.spec.delete_when != CleanupMode::Never {
                        let removed = self.delete_orphans(&task, Some(&deleted), &|| false).await?;
                        if removed > 0 {
                            self.emit_cleanup(&task, removed);
                        }
                    }
                }

                cursor = last_seq;
                cursors::set(&self.pool, &collection, cursor).await?;
                self.metrics.observe_change_lag(&collection, lag_ms);

                if planned > 0 {
                    self.runner.speed_up(&collection);
                }

                if drained < self.options.change_batch_size {
                    break;
                }
            }

            resume.insert(collection, cursor);
        }
        Ok(())
    }

    /// Work through every pending reconciliation: ordered id scan from the
    /// persisted checkpoint, planning each batch, then orphan cleanup.
    async fn reconcile_pending(&self, cancel: &CancellationToken) -> Result<()> {
        for row in reconciliations::list_pending(&self.pool).await? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            // Tasks registered by other instances stay pending until an
            // instance that knows them becomes leader.
            let Some(task) = self.registry.get(&row.task) else {
                continue;
            };
            if row.signature != task.signature {
                // The stored flag belongs to an older trigger signature;
                // startup() refreshed it, so re-read on the next pass.
                continue;
            }

            self.sinks.info(InfoEvent::new(
                CODE_REACTIVE_TASK_RECONCILIATION_STARTED,
                format!("reconciliation started for {}", task.name()),
                json!({ "task": task.name(), "checkpoint": row.checkpoint_id }),
            ));

            let mut after = row.checkpoint_id.clone().unwrap_or_default();
            let mut scanned: u64 = 0;
            loop {
                if cancel.is_cancelled() {
                    // The checkpoint is persisted; the next leader resumes.
                    return Ok(());
                }
                let ids = plan::fetch_source_id_batch(
                    &self.pool,
                    &task,
                    &after,
                    self.options.reconcile_batch_size,
                )
                .await?;
                if ids.is_empty() {
                    break;
                }
                scanned += ids.len() as u64;
                plan::plan_documents(&self.pool, &task, &ids, false).await?;
                after = ids.last().expect("non-empty batch").clone();
                reconciliations::set_checkpoint(&self.pool, task.name(), &after).await?;
                self.runner.speed_up(&task.spec.source_collection);
            }

            if task.spec.delete_when != CleanupMode::Never {
                let removed = self
                    .delete_orphans(&task, None, &|| cancel.is_cancelled())
                    .await?;
                if removed > 0 {
                    self.emit_cleanup(&task, removed);
                }
            }

            reconciliations::complete(&self.pool, task.name()).await?;
            self.metrics.record_reconciliation(task.name());
            self.sinks.info(InfoEvent::new(
                CODE_REACTIVE_TASK_RECONCILIATION_FINISHED,
                format!("reconciliation finished for {}", task.name()),
                json!({ "task": task.name(), "scanned": scanned }),
            ));
        }
        Ok(())
    }

    /// Periodic maintenance: orphan deletion per task, change-log pruning
    /// with gap detection, stale metrics-instance pruning.
    async fn cleanup_cycle(&self, cancel: &CancellationToken) -> Result<()> {
        for task in self.registry.all() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if task.spec.delete_when == CleanupMode::Never {
                continue;
            }
            let removed = self
                .delete_orphans(&task, None, &|| cancel.is_cancelled())
                .await?;
            if removed > 0 {
                self.emit_cleanup(&task, removed);
            }
        }

        // Detect cursors that fell behind the retention boundary before
        // pruning makes the gap unrecoverable.
        let retention_ms = self.options.change_retention.as_millis() as i64;
        for collection in self.registry.collections() {
            let boundary: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(seq) FROM document_changes \
                 WHERE collection = $1 \
                   AND occurred_at < now() - $2 * interval '1 millisecond'",
            )
            .bind(&collection)
            .bind(retention_ms)
            .fetch_one(&self.pool)
            .await
            .context("failed to read change retention boundary")?;

            if let Some(boundary) = boundary {
                let cursor = cursors::get(&self.pool, &collection).await?.unwrap_or(0);
                if cursor < boundary {
                    self.flag_history_gap(&collection, cursor, boundary).await?;
                    let latest = changes::latest_seq(&self.pool, &collection).await?;
                    cursors::set(&self.pool, &collection, latest).await?;
                    changes::prune_older_than(&self.pool, retention_ms).await?;
                    // Surrender leadership; the next leader reconciles.
                    return Err(anyhow!(
                        "change history lost for {collection}: cursor {cursor} behind {boundary}"
                    ));
                }
            }
        }

        let pruned = changes::prune_older_than(&self.pool, retention_ms).await?;
        if pruned > 0 {
            debug!(pruned, "pruned change log");
        }
        metrics_db::prune_stale(&self.pool, METRICS_STALENESS.as_millis() as i64).await?;

        Ok(())
    }

    async fn delete_orphans(
        &self,
        task: &RegisteredTask,
        limit_source_ids: Option<&[String]>,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64> {
        tasks::delete_orphaned(
            &self.pool,
            &task.tasks_table,
            &task.source_table,
            task.name(),
            task.spec.delete_when,
            &task.predicate.to_sql("s"),
            task.keep_for_ms(),
            should_stop,
            limit_source_ids,
        )
        .await
    }

    fn emit_cleanup(&self, task: &RegisteredTask, removed: u64) {
        self.sinks.info(InfoEvent::new(
            CODE_REACTIVE_TASK_CLEANUP,
            format!("removed {removed} orphaned records for {}", task.name()),
            json!({ "task": task.name(), "removed": removed }),
        ));
    }

    /// Plan one document immediately, bypassing the debounce and the
    /// changed-snapshot check (the manual trigger path).
    pub async fn trigger_document(&self, task: &RegisteredTask, doc_id: &str) -> Result<u64> {
        let planned =
            plan::plan_documents(&self.pool, task, &[doc_id.to_owned()], true).await?;
        self.runner.speed_up(&task.spec.source_collection);
        Ok(planned)
    }
}
