//! The facade: configure → register tasks → start → stop, plus the
//! administrative query operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ripple_db::models::{Paging, TaskFilter, TaskRecord, TaskStatistics};
use ripple_db::pool as db_pool;
use ripple_db::queries::{schema, tasks, TableName};

use crate::election::{self, LeaderElector, DEFAULT_LEASE_TTL};
use crate::events::{InfoEvent, Sinks, CODE_MANUAL_TRIGGER};
use crate::ingest::{plan, Planner, PlannerOptions};
use crate::metrics::{MetricsCollector, ScrapeMode};
use crate::registry::{ReactiveTaskSpec, RegisteredTask, Registry};
use crate::workers::pool::{AdaptiveRunner, PollSettings, RunOne};
use crate::workers::worker::{identity_caller, TaskCaller, WorkerEngine, WorkerOptions};
use crate::workers::ThrottleTable;

/// Engine-wide tuning. Everything has a production default.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Global worker concurrency budget.
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    /// Per-source polling defaults.
    pub poll: PollSettings,
    pub planner: PlannerOptions,
    pub lease_ttl: Duration,
    /// Disables the metrics collector entirely when false.
    pub monitoring: bool,
    pub metrics_flush_interval: Duration,
    /// Middleware wrapped around every handler invocation.
    pub task_caller: TaskCaller,
    pub sinks: Sinks,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            visibility_timeout: Duration::from_secs(5 * 60),
            poll: PollSettings::default(),
            planner: PlannerOptions::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
            monitoring: true,
            metrics_flush_interval: Duration::from_secs(3),
            task_caller: identity_caller(),
            sinks: Sinks::default(),
        }
    }
}

impl std::fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("concurrency", &self.concurrency)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("lease_ttl", &self.lease_ttl)
            .field("monitoring", &self.monitoring)
            .finish_non_exhaustive()
    }
}

/// Filter surface of the administrative operations.
#[derive(Debug, Clone, Default)]
pub struct ReactiveTaskQuery {
    pub task: Option<String>,
    /// Single status or comma-separated list.
    pub status: Option<String>,
    pub source_doc_id: Option<String>,
    pub error_message: Option<String>,
    pub has_error: Option<bool>,
    /// Restrict to tasks of one source collection.
    pub collection: Option<String>,
}

impl ReactiveTaskQuery {
    fn to_filter(&self) -> Result<TaskFilter> {
        let statuses = match &self.status {
            Some(list) => TaskFilter::parse_statuses(list)
                .map_err(|e| anyhow::anyhow!(e))
                .context("invalid status filter")?,
            None => Vec::new(),
        };
        Ok(TaskFilter {
            task: self.task.clone(),
            statuses,
            source_doc_id: self.source_doc_id.clone(),
            error_message: self.error_message.clone(),
            has_error: self.has_error,
        })
    }
}

/// Cluster-level diagnostics returned by `get_reactive_task_info`.
#[derive(Debug, Clone)]
pub struct ReactiveTaskInfo {
    pub instance_id: Uuid,
    pub is_leader: bool,
    pub leader: Option<Uuid>,
    pub statistics: Vec<TaskStatistics>,
}

struct RunningState {
    cancel: CancellationToken,
    registry: Arc<Registry>,
    elector: Arc<LeaderElector>,
    runner: Arc<AdaptiveRunner>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    pool: PgPool,
    options: SchedulerOptions,
    instance_id: Uuid,
    registry: StdMutex<Registry>,
    started: AtomicBool,
    running: Mutex<Option<RunningState>>,
    throttle: Arc<ThrottleTable>,
    metrics: Arc<MetricsCollector>,
}

/// The reactive task scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Wire a scheduler onto an existing pool. Nothing runs until
    /// [`Self::start`].
    pub fn configure(pool: PgPool, options: SchedulerOptions) -> Self {
        let instance_id = Uuid::new_v4();
        let metrics = Arc::new(MetricsCollector::new(options.monitoring, instance_id));
        Self {
            inner: Arc::new(Inner {
                pool,
                options,
                instance_id,
                registry: StdMutex::new(Registry::default()),
                started: AtomicBool::new(false),
                running: Mutex::new(None),
                throttle: Arc::new(ThrottleTable::default()),
                metrics,
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Register a task definition. Validates the filter, projection,
    /// debounce, retry policy, and cleanup policy; fails after `start()`
    /// or on a name collision.
    pub fn reactive_task(&self, spec: ReactiveTaskSpec) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            bail!(crate::registry::RegistrationError::AlreadyStarted);
        }
        self.inner
            .registry
            .lock()
            .unwrap()
            .insert(spec)
            .map(|_| ())
            .map_err(Into::into)
    }

    /// Provision schema, start the workers and the election, and begin
    /// planning when leadership arrives. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        db_pool::run_migrations(&inner.pool, db_pool::default_migrations_path()).await?;

        let registry = Arc::new(std::mem::take(&mut *inner.registry.lock().unwrap()));
        inner.started.store(true, Ordering::SeqCst);

        // Dynamic schema: tasks tables and source triggers.
        for task in registry.all() {
            schema::ensure_tasks_table(&inner.pool, &task.tasks_table).await?;
            schema::ensure_source_trigger(&inner.pool, &task.source_table).await?;
        }

        let engine = Arc::new(WorkerEngine::new(
            inner.pool.clone(),
            Arc::clone(&registry),
            Arc::clone(&inner.throttle),
            inner.options.sinks.clone(),
            Arc::clone(&inner.metrics),
            inner.options.task_caller.clone(),
            WorkerOptions {
                visibility_timeout: inner.options.visibility_timeout,
            },
        ));
        let run_one: RunOne = {
            let engine = Arc::clone(&engine);
            Arc::new(move |collection: String| {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.run_one(&collection).await })
            })
        };

        let runner = Arc::new(AdaptiveRunner::new(inner.options.concurrency, run_one));
        for collection in registry.collections() {
            runner.register_source(&collection, inner.options.poll.clone())?;
        }
        runner.start().await;

        let elector = Arc::new(LeaderElector::new(
            inner.pool.clone(),
            inner.instance_id,
            inner.options.lease_ttl,
            inner.options.sinks.clone(),
        ));
        elector.start().await;

        let planner = Arc::new(Planner::new(
            inner.pool.clone(),
            Arc::clone(&registry),
            Arc::clone(&runner),
            inner.options.sinks.clone(),
            Arc::clone(&inner.metrics),
            inner.options.planner.clone(),
        ));

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(leadership_loop(
            Arc::clone(&elector),
            planner,
            inner.options.sinks.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(metrics_loop(
            inner.pool.clone(),
            Arc::clone(&inner.metrics),
            Arc::clone(&registry),
            Arc::clone(&elector),
            inner.options.sinks.clone(),
            inner.options.metrics_flush_interval,
            cancel.clone(),
        )));

        *running = Some(RunningState {
            cancel,
            registry,
            elector,
            runner,
            handles,
        });
        Ok(())
    }

    /// Stop planning, polling, and the election; waits for in-flight
    /// handlers. Idempotent.
    pub async fn stop(&self) {
        let Some(state) = self.inner.running.lock().await.take() else {
            return;
        };
        state.cancel.cancel();
        state.runner.stop().await;
        state.elector.stop().await;
        for handle in state.handles {
            let _ = handle.await;
        }
    }

    /// Resolve the distinct tasks tables a query touches, with the tasks
    /// registered in each.
    async fn resolve_tables(&self, query: &ReactiveTaskQuery) -> Result<Vec<TableName>> {
        let running = self.inner.running.lock().await;
        let registry = match running.as_ref() {
            Some(state) => Arc::clone(&state.registry),
            None => bail!("scheduler is not started"),
        };
        drop(running);

        let tasks: Vec<Arc<RegisteredTask>> = match (&query.task, &query.collection) {
            (Some(task), _) => registry.get(task).into_iter().collect(),
            (None, Some(collection)) => registry.tasks_for_collection(collection),
            (None, None) => registry.all(),
        };

        let mut tables: Vec<TableName> = Vec::new();
        for task in tasks {
            if !tables.contains(&task.tasks_table) {
                tables.push(task.tasks_table.clone());
            }
        }
        Ok(tables)
    }

    /// List task records matching the query, newest first.
    pub async fn get_reactive_tasks(
        &self,
        query: &ReactiveTaskQuery,
        paging: Option<Paging>,
    ) -> Result<Vec<TaskRecord>> {
        let filter = query.to_filter()?;
        let paging = paging.unwrap_or_default();

        let mut records: Vec<TaskRecord> = Vec::new();
        for table in self.resolve_tables(query).await? {
            records.extend(tasks::list_tasks(&self.inner.pool, &table, &filter, paging).await?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(paging.limit as usize);
        Ok(records)
    }

    /// Count task records matching the query.
    pub async fn count_reactive_tasks(&self, query: &ReactiveTaskQuery) -> Result<i64> {
        let filter = query.to_filter()?;
        let mut total = 0;
        for table in self.resolve_tables(query).await? {
            total += tasks::count_tasks(&self.inner.pool, &table, &filter).await?;
        }
        Ok(total)
    }

    /// Reset matching records so they run again. Records currently
    /// processing only move to `processing_dirty` (the running handler
    /// finishes first and the follow-up is scheduled by its
    /// finalization).
    pub async fn retry_reactive_tasks(&self, query: &ReactiveTaskQuery) -> Result<u64> {
        let filter = query.to_filter()?;
        let mut total = 0;
        for table in self.resolve_tables(query).await? {
            total += tasks::reset_tasks(&self.inner.pool, &table, &filter).await?;
        }

        // Wake pollers so the reset records run promptly.
        let running = self.inner.running.lock().await;
        if let Some(state) = running.as_ref() {
            for collection in state.registry.collections() {
                state.runner.speed_up(&collection);
            }
        }
        Ok(total)
    }

    /// Per-task statistics plus leadership diagnostics.
    pub async fn get_reactive_task_info(&self) -> Result<ReactiveTaskInfo> {
        let mut statistics: Vec<TaskStatistics> = Vec::new();
        for table in self.resolve_tables(&ReactiveTaskQuery::default()).await? {
            statistics
                .extend(tasks::get_statistics(&self.inner.pool, &table, &TaskFilter::default()).await?);
        }
        statistics.sort_by(|a, b| a.task.cmp(&b.task));

        let running = self.inner.running.lock().await;
        let is_leader = running
            .as_ref()
            .is_some_and(|state| state.elector.is_leader());
        drop(running);

        Ok(ReactiveTaskInfo {
            instance_id: self.inner.instance_id,
            is_leader,
            leader: election::current_leader(&self.inner.pool).await?,
            statistics,
        })
    }

    /// Prometheus metrics text, or `None` when monitoring is disabled.
    pub async fn prometheus_metrics(&self, mode: ScrapeMode) -> Result<Option<String>> {
        self.inner.metrics.scrape(&self.inner.pool, mode).await
    }

    /// Plan one document for one task immediately, bypassing the debounce
    /// and the changed-snapshot check.
    pub async fn trigger_task(&self, task: &str, source_doc_id: &str) -> Result<()> {
        let running = self.inner.running.lock().await;
        let Some(state) = running.as_ref() else {
            bail!("scheduler is not started");
        };
        let Some(task) = state.registry.get(task) else {
            bail!("unknown task {task:?}");
        };
        let runner = Arc::clone(&state.runner);
        drop(running);

        plan::plan_documents(&self.inner.pool, &task, &[source_doc_id.to_owned()], true).await?;
        runner.speed_up(&task.spec.source_collection);

        self.inner.options.sinks.info(InfoEvent::new(
            CODE_MANUAL_TRIGGER,
            format!("manual trigger for {}", task.name()),
            json!({ "task": task.name(), "sourceDocId": source_doc_id }),
        ));
        Ok(())
    }
}

/// Spawn the planner while this instance holds leadership; cancel it on
/// loss; surrender leadership when the planner fails.
async fn leadership_loop(
    elector: Arc<LeaderElector>,
    planner: Arc<Planner>,
    sinks: Sinks,
    cancel: CancellationToken,
) {
    let mut leadership = elector.subscribe();
    let mut planner_run: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let is_leader = *leadership.borrow_and_update();

        match (is_leader, &mut planner_run) {
            (true, None) => {
                let child = cancel.child_token();
                let planner = Arc::clone(&planner);
                let elector = Arc::clone(&elector);
                let sinks = sinks.clone();
                let run_cancel = child.clone();
                let handle = tokio::spawn(async move {
                    if let Err(err) = planner.run(run_cancel).await {
                        sinks.error(&err);
                        elector.force_lose_leader().await;
                    }
                });
                planner_run = Some((child, handle));
            }
            (false, Some(_)) => {
                let (child, handle) = planner_run.take().expect("checked Some");
                child.cancel();
                let _ = handle.await;
            }
            _ => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((child, handle)) = planner_run.take() {
        child.cancel();
        let _ = handle.await;
    }
}

/// Periodically publish the local metrics snapshot; the leader also
/// computes the store-wide gauges.
#[allow(clippy::too_many_arguments)]
async fn metrics_loop(
    pool: PgPool,
    metrics: Arc<MetricsCollector>,
    registry: Arc<Registry>,
    elector: Arc<LeaderElector>,
    sinks: Sinks,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    if !metrics.enabled() {
        return;
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(flush_interval) => {}
        }

        if elector.is_leader() {
            match MetricsCollector::compute_global(&pool, &registry).await {
                Ok(global) => metrics.set_global(Some(global)),
                Err(err) => sinks.error(&err),
            }
        } else {
            metrics.set_global(None);
        }

        if let Err(err) = metrics.flush(&pool).await {
            sinks.error(&err);
        }
    }
}
