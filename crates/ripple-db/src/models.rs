use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    ProcessingDirty,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the record currently holds a worker lock.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Processing | Self::ProcessingDirty)
    }

    /// Whether the record is terminal (`next_run_at` must be NULL).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::ProcessingDirty => "processing_dirty",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processing_dirty" => Ok(Self::ProcessingDirty),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// When orphaned task records may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Task records are never removed.
    #[default]
    Never,
    /// Removed once the source document has been deleted.
    SourceDocumentDeleted,
    /// Removed once the source document is deleted or no longer satisfies
    /// the task predicate.
    SourceDocumentDeletedOrNoLongerMatching,
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Never => "never",
            Self::SourceDocumentDeleted => "source_document_deleted",
            Self::SourceDocumentDeletedOrNoLongerMatching => {
                "source_document_deleted_or_no_longer_matching"
            }
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// What to do with existing records when a task's handler version changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionChangePolicy {
    /// No action.
    #[default]
    None,
    /// Reset `failed` records to pending.
    ReprocessFailed,
    /// Reset `completed` and `failed` records to pending.
    ReprocessAll,
}

// ---------------------------------------------------------------------------

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl FromStr for ChangeOp {
    type Err = ChangeOpParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(ChangeOpParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ChangeOp`] string.
#[derive(Debug, Clone)]
pub struct ChangeOpParseError(pub String);

impl fmt::Display for ChangeOpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid change op: {:?}", self.0)
    }
}

impl std::error::Error for ChangeOpParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One task record: the planned/locked/finished unit of work for a
/// `(task, source_doc_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    pub id: Uuid,
    pub task: String,
    pub source_doc_id: String,
    pub status: TaskStatus,
    /// When a worker may take the record; the visibility deadline while
    /// processing; NULL when terminal.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Original scheduled time, preserved across deferrals; drives lag
    /// metrics.
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_finalized_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `{"at": …, "duration_ms": …}` of the last successful run.
    pub last_success: Option<Value>,
    /// Bounded array of execution entries, oldest first.
    pub execution_history: Value,
    /// Watch-projection snapshot that triggered the current planning.
    pub last_observed: Option<Value>,
    /// Handler version recorded on last successful processing.
    pub handler_version: Option<String>,
}

/// One entry of a record's bounded execution history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEntry {
    pub at: DateTime<Utc>,
    pub status: TaskStatus,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A row of the append-only change log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeRow {
    pub seq: i64,
    pub collection: String,
    pub doc_id: String,
    pub op: ChangeOp,
    pub occurred_at: DateTime<Utc>,
}

/// The singleton leader lease row.
#[derive(Debug, Clone, FromRow)]
pub struct LeaderLease {
    pub instance_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Reconciliation state for one task: completion flag, trigger signature,
/// and the ordered-scan checkpoint.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationRow {
    pub task: String,
    pub collection: String,
    pub signature: String,
    pub completed: bool,
    pub checkpoint_id: Option<String>,
    pub handler_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One instance's snapshot in the shared metrics registry.
#[derive(Debug, Clone, FromRow)]
pub struct MetricsInstanceRow {
    pub instance_id: Uuid,
    pub last_seen: DateTime<Utc>,
    pub metrics: Value,
}

// ---------------------------------------------------------------------------
// Query-surface types
// ---------------------------------------------------------------------------

/// Filter for listing, counting, and retrying task records.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Exact task name.
    pub task: Option<String>,
    /// Statuses to include; empty means all.
    pub statuses: Vec<TaskStatus>,
    /// Exact source document id.
    pub source_doc_id: Option<String>,
    /// Substring match against `last_error`.
    pub error_message: Option<String>,
    /// `Some(true)` = only records with an error, `Some(false)` = without.
    pub has_error: Option<bool>,
}

impl TaskFilter {
    /// Parse the status part of a filter from a single name or a
    /// comma-separated list.
    pub fn parse_statuses(input: &str) -> Result<Vec<TaskStatus>, TaskStatusParseError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(TaskStatus::from_str)
            .collect()
    }
}

/// Offset/limit paging for list operations.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Aggregated statistics for one task name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatistics {
    pub task: String,
    pub pending: i64,
    pub processing: i64,
    pub processing_dirty: i64,
    pub completed: i64,
    pub failed: i64,
    pub with_error: i64,
    /// Oldest `due_at` among pending records; `now - oldest_due` is the
    /// task's global lag.
    pub oldest_due: Option<DateTime<Utc>>,
}

impl TaskStatistics {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.processing_dirty + self.completed + self.failed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::ProcessingDirty,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_classification() {
        assert!(TaskStatus::Processing.is_in_flight());
        assert!(TaskStatus::ProcessingDirty.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::ProcessingDirty.is_terminal());
    }

    #[test]
    fn change_op_display_roundtrip() {
        let variants = [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete];
        for v in &variants {
            let s = v.to_string();
            let parsed: ChangeOp = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn status_list_parsing() {
        let statuses = TaskFilter::parse_statuses("pending, failed").unwrap();
        assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Failed]);

        let single = TaskFilter::parse_statuses("processing_dirty").unwrap();
        assert_eq!(single, vec![TaskStatus::ProcessingDirty]);

        assert!(TaskFilter::parse_statuses("pending,bogus").is_err());
    }

    #[test]
    fn execution_entry_serializes_without_null_error() {
        let entry = ExecutionEntry {
            at: Utc::now(),
            status: TaskStatus::Completed,
            duration_ms: 12,
            error: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "completed");
    }
}
