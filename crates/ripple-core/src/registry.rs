//! In-memory catalog of task definitions.
//!
//! Definitions are validated and compiled once at registration; everything
//! downstream (planner, workers, cleanup) works with the immutable
//! [`RegisteredTask`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use ripple_db::models::{CleanupMode, VersionChangePolicy};
use ripple_db::queries::TableName;
use thiserror::Error;

use crate::filter::{compile_projection, CompiledFilter, FilterError, Projection};
use crate::retry::{RetryPolicy, RetryPolicyError};
use crate::workers::context::TaskContext;

/// Debounce values above this are almost certainly a unit mistake.
const MAX_DEBOUNCE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default execution-history bound per record.
pub const DEFAULT_EXECUTION_HISTORY_LIMIT: usize = 5;

/// The future returned by a task handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A user-supplied task handler.
pub type TaskHandler = Arc<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Errors raised by [`Registry::insert`]. All of these are configuration
/// mistakes surfaced synchronously at registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("task {0:?} is already registered")]
    DuplicateTask(String),

    #[error("tasks cannot be registered after start()")]
    AlreadyStarted,

    #[error("debounce {0:?} exceeds the maximum of 24h")]
    DebounceTooLarge(humantime::Duration),

    #[error("execution history limit must be at least 1")]
    InvalidHistoryLimit,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Retry(#[from] RetryPolicyError),

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),
}

/// A task definition as supplied by the caller.
#[derive(Clone)]
pub struct ReactiveTaskSpec {
    /// Unique task name.
    pub task: String,
    /// Source table holding `(id, doc)` documents.
    pub source_collection: String,
    /// Tasks table name; defaults to `{source_collection}_tasks`.
    pub tasks_collection: Option<String>,
    /// Predicate selecting the documents this task reacts to.
    pub filter: Value,
    /// Watch projection: the part of the document whose change triggers a
    /// run. Empty object watches the whole document.
    pub projection: Value,
    /// Delay applied to freshly planned runs, coalescing update bursts.
    pub debounce: Duration,
    pub retry: RetryPolicy,
    pub handler: TaskHandler,
    pub handler_version: Option<String>,
    pub on_handler_version_change: VersionChangePolicy,
    /// `false` opts out of re-scanning when the filter or projection
    /// changes; only stream-visible mutations take effect.
    pub reconcile_on_trigger_change: bool,
    pub delete_when: CleanupMode,
    /// Minimum record age before orphan cleanup may delete it.
    pub keep_for: Duration,
    pub execution_history_limit: usize,
    /// Reset the retry counter when the watched data changes.
    pub reset_retries_on_data_change: bool,
}

impl ReactiveTaskSpec {
    /// A spec with defaults; callers override fields with struct-update
    /// syntax (at minimum the handler).
    pub fn new(
        task: impl Into<String>,
        source_collection: impl Into<String>,
        filter: Value,
    ) -> Self {
        Self {
            task: task.into(),
            source_collection: source_collection.into(),
            tasks_collection: None,
            filter,
            projection: json!({}),
            debounce: Duration::ZERO,
            retry: RetryPolicy::Exponential {
                min: None,
                max: None,
                factor: 2.0,
            },
            handler: handler(|_ctx| async { Ok(()) }),
            handler_version: None,
            on_handler_version_change: VersionChangePolicy::None,
            reconcile_on_trigger_change: true,
            delete_when: CleanupMode::Never,
            keep_for: Duration::ZERO,
            execution_history_limit: DEFAULT_EXECUTION_HISTORY_LIMIT,
            reset_retries_on_data_change: false,
        }
    }
}

impl fmt::Debug for ReactiveTaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveTaskSpec")
            .field("task", &self.task)
            .field("source_collection", &self.source_collection)
            .field("filter", &self.filter)
            .field("projection", &self.projection)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

/// A validated, compiled task definition.
pub struct RegisteredTask {
    pub spec: ReactiveTaskSpec,
    pub predicate: CompiledFilter,
    pub projection: Projection,
    pub source_table: TableName,
    pub tasks_table: TableName,
    /// Trigger signature: changes to the filter, projection, or handler
    /// version invalidate prior reconciliations.
    pub signature: String,
}

impl RegisteredTask {
    fn compile(spec: ReactiveTaskSpec) -> Result<Self, RegistrationError> {
        if spec.task.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if spec.debounce > MAX_DEBOUNCE {
            return Err(RegistrationError::DebounceTooLarge(spec.debounce.into()));
        }
        if spec.execution_history_limit == 0 {
            return Err(RegistrationError::InvalidHistoryLimit);
        }
        spec.retry.validate()?;

        let predicate = CompiledFilter::compile(&spec.filter)?;
        let projection = compile_projection(&spec.projection)?;

        let source_table = TableName::new(&spec.source_collection)
            .map_err(|e| RegistrationError::InvalidCollection(e.to_string()))?;
        let tasks_table = match &spec.tasks_collection {
            Some(name) => TableName::new(name),
            None => TableName::new(format!("{}_tasks", spec.source_collection)),
        }
        .map_err(|e| RegistrationError::InvalidCollection(e.to_string()))?;

        let signature = json!({
            "filter": spec.filter,
            "projection": spec.projection,
            "handler_version": spec.handler_version,
        })
        .to_string();

        Ok(Self {
            spec,
            predicate,
            projection,
            source_table,
            tasks_table,
            signature,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.task
    }

    pub fn debounce_ms(&self) -> i64 {
        self.spec.debounce.as_millis() as i64
    }

    pub fn keep_for_ms(&self) -> i64 {
        self.spec.keep_for.as_millis() as i64
    }
}

impl fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("task", &self.spec.task)
            .field("source_table", &self.source_table)
            .field("tasks_table", &self.tasks_table)
            .finish_non_exhaustive()
    }
}

/// The catalog, keyed by task name.
#[derive(Debug, Default)]
pub struct Registry {
    tasks: HashMap<String, Arc<RegisteredTask>>,
}

impl Registry {
    /// Validate, compile, and insert a definition.
    pub fn insert(&mut self, spec: ReactiveTaskSpec) -> Result<Arc<RegisteredTask>, RegistrationError> {
        if self.tasks.contains_key(&spec.task) {
            return Err(RegistrationError::DuplicateTask(spec.task));
        }
        let registered = Arc::new(RegisteredTask::compile(spec)?);
        self.tasks
            .insert(registered.name().to_owned(), Arc::clone(&registered));
        Ok(registered)
    }

    pub fn get(&self, task: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks.get(task).cloned()
    }

    /// All definitions, in no particular order.
    pub fn all(&self) -> Vec<Arc<RegisteredTask>> {
        self.tasks.values().cloned().collect()
    }

    /// Definitions grouped under one source collection.
    pub fn tasks_for_collection(&self, collection: &str) -> Vec<Arc<RegisteredTask>> {
        self.tasks
            .values()
            .filter(|t| t.spec.source_collection == collection)
            .cloned()
            .collect()
    }

    /// Distinct source collections, sorted for deterministic iteration.
    pub fn collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self
            .tasks
            .values()
            .map(|t| t.spec.source_collection.clone())
            .collect();
        collections.sort();
        collections.dedup();
        collections
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec(name: &str) -> ReactiveTaskSpec {
        ReactiveTaskSpec::new(name, "orders", json!({"status": "A"}))
    }

    #[test]
    fn insert_compiles_and_defaults_tasks_table() {
        let mut registry = Registry::default();
        let task = registry.insert(spec("t1")).unwrap();
        assert_eq!(task.tasks_table.as_str(), "orders_tasks");
        assert_eq!(task.source_table.as_str(), "orders");
        assert!(!task.signature.is_empty());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = Registry::default();
        registry.insert(spec("t1")).unwrap();
        assert!(matches!(
            registry.insert(spec("t1")),
            Err(RegistrationError::DuplicateTask(_))
        ));
    }

    #[test]
    fn invalid_filter_fails_registration() {
        let mut registry = Registry::default();
        let mut bad = spec("t2");
        bad.filter = json!({"a": {"$mod": [2, 0]}});
        assert!(matches!(
            registry.insert(bad),
            Err(RegistrationError::Filter(_))
        ));
    }

    #[test]
    fn exclusion_projection_fails_registration() {
        let mut registry = Registry::default();
        let mut bad = spec("t3");
        bad.projection = json!({"v": 0});
        assert!(matches!(
            registry.insert(bad),
            Err(RegistrationError::Filter(FilterError::ExclusionProjection(_)))
        ));
    }

    #[test]
    fn grouping_by_collection() {
        let mut registry = Registry::default();
        registry.insert(spec("a")).unwrap();
        registry.insert(spec("b")).unwrap();
        registry
            .insert(ReactiveTaskSpec::new("c", "users", json!({})))
            .unwrap();

        assert_eq!(registry.tasks_for_collection("orders").len(), 2);
        assert_eq!(registry.collections(), vec!["orders", "users"]);
    }

    #[test]
    fn signature_tracks_trigger_inputs() {
        let a = RegisteredTask::compile(spec("t")).unwrap();
        let mut changed = spec("t");
        changed.filter = json!({"status": "B"});
        let b = RegisteredTask::compile(changed).unwrap();
        assert_ne!(a.signature, b.signature);

        let mut versioned = spec("t");
        versioned.handler_version = Some("v2".to_owned());
        let c = RegisteredTask::compile(versioned).unwrap();
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn oversized_debounce_rejected() {
        let mut bad = spec("t4");
        bad.debounce = Duration::from_secs(25 * 60 * 60);
        assert!(matches!(
            RegisteredTask::compile(bad),
            Err(RegistrationError::DebounceTooLarge(_))
        ));
    }
}
