//! Metrics: local counters and histograms, the shared registry document,
//! and Prometheus rendering.
//!
//! Each instance aggregates its own counters and periodically flushes a
//! JSON snapshot into `metrics_instances` under its instance id. The
//! leader additionally computes store-wide gauges (queue depth, global
//! lag) and prunes snapshots of instances unseen for
//! [`METRICS_STALENESS`]. Scrapes come in two modes: `local` (this
//! instance, plus globals when it is the leader) and `cluster` (sum
//! counters and merge histograms across live instances; globals come from
//! the leader's snapshot).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use ripple_db::models::TaskFilter;
use ripple_db::queries::{metrics as metrics_db, tasks, TableName};

use crate::registry::Registry;

/// Instances unseen for this long are pruned from the shared registry.
pub const METRICS_STALENESS: Duration = Duration::from_secs(10);

/// Histogram bucket upper bounds, in milliseconds.
const DURATION_BOUNDS_MS: [i64; 12] = [
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 30_000, 300_000,
];

/// Which instances a scrape covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    Local,
    Cluster,
}

/// A fixed-bucket histogram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Histogram {
    bounds: Vec<i64>,
    counts: Vec<u64>,
    sum: i64,
    count: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bounds: DURATION_BOUNDS_MS.to_vec(),
            counts: vec![0; DURATION_BOUNDS_MS.len() + 1],
            sum: 0,
            count: 0,
        }
    }
}

impl Histogram {
    fn observe(&mut self, value: i64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }

    fn merge(&mut self, other: &Histogram) -> Result<()> {
        if self.bounds != other.bounds || self.counts.len() != other.counts.len() {
            bail!("histogram bucket layouts differ between instances");
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }
}

/// Leader-computed store-wide gauges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalMetrics {
    /// Pending records per task.
    pub queue_depth: BTreeMap<String, i64>,
    /// `now - min(due_at)` of pending records per task, in ms.
    pub lag_ms: BTreeMap<String, i64>,
}

/// One instance's snapshot, as stored in the shared registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    /// Execution duration histograms keyed by task, then by outcome
    /// (`success` / `failed`).
    executions: BTreeMap<String, BTreeMap<String, Histogram>>,
    retries: BTreeMap<String, u64>,
    /// Change-stream lag per source collection (leader-observed).
    change_lag_ms: BTreeMap<String, i64>,
    /// Last reconciliation completion per task, epoch seconds.
    reconciled_at: BTreeMap<String, i64>,
    /// Present only in the leader's snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<GlobalMetrics>,
}

/// The per-instance collector. All recording methods are no-ops when
/// monitoring is disabled.
pub struct MetricsCollector {
    enabled: bool,
    instance_id: Uuid,
    local: Mutex<Snapshot>,
}

impl MetricsCollector {
    pub fn new(enabled: bool, instance_id: Uuid) -> Self {
        Self {
            enabled,
            instance_id,
            local: Mutex::new(Snapshot::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_execution(&self, task: &str, success: bool, duration_ms: i64) {
        if !self.enabled {
            return;
        }
        let outcome = if success { "success" } else { "failed" };
        let mut local = self.local.lock().unwrap();
        local
            .executions
            .entry(task.to_owned())
            .or_default()
            .entry(outcome.to_owned())
            .or_default()
            .observe(duration_ms);
    }

    pub fn record_retry(&self, task: &str) {
        if !self.enabled {
            return;
        }
        *self
            .local
            .lock()
            .unwrap()
            .retries
            .entry(task.to_owned())
            .or_default() += 1;
    }

    pub fn observe_change_lag(&self, collection: &str, lag_ms: i64) {
        if !self.enabled {
            return;
        }
        self.local
            .lock()
            .unwrap()
            .change_lag_ms
            .insert(collection.to_owned(), lag_ms);
    }

    pub fn record_reconciliation(&self, task: &str) {
        if !self.enabled {
            return;
        }
        self.local
            .lock()
            .unwrap()
            .reconciled_at
            .insert(task.to_owned(), Utc::now().timestamp());
    }

    /// Compute the leader-only gauges from the store.
    pub async fn compute_global(pool: &PgPool, registry: &Registry) -> Result<GlobalMetrics> {
        let mut global = GlobalMetrics::default();
        let now = Utc::now();

        let mut seen_tables: Vec<TableName> = Vec::new();
        for task in registry.all() {
            if seen_tables.contains(&task.tasks_table) {
                continue;
            }
            seen_tables.push(task.tasks_table.clone());

            let stats =
                tasks::get_statistics(pool, &task.tasks_table, &TaskFilter::default()).await?;
            for entry in stats {
                global.queue_depth.insert(entry.task.clone(), entry.pending);
                if let Some(oldest) = entry.oldest_due {
                    global
                        .lag_ms
                        .insert(entry.task, (now - oldest).num_milliseconds().max(0));
                }
            }
        }

        Ok(global)
    }

    /// Install (leader) or clear (follower) the global gauges carried in
    /// this instance's snapshot.
    pub fn set_global(&self, global: Option<GlobalMetrics>) {
        if !self.enabled {
            return;
        }
        self.local.lock().unwrap().global = global;
    }

    /// Publish the local snapshot to the shared registry.
    pub async fn flush(&self, pool: &PgPool) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let snapshot = self.local.lock().unwrap().clone();
        let value = serde_json::to_value(&snapshot).context("failed to encode metrics")?;
        metrics_db::upsert_instance(pool, self.instance_id, &value).await
    }

    /// Render Prometheus text. Returns `None` when monitoring is disabled.
    pub async fn scrape(&self, pool: &PgPool, mode: ScrapeMode) -> Result<Option<String>> {
        if !self.enabled {
            return Ok(None);
        }

        let snapshot = match mode {
            ScrapeMode::Local => self.local.lock().unwrap().clone(),
            ScrapeMode::Cluster => {
                let rows =
                    metrics_db::list_live(pool, METRICS_STALENESS.as_millis() as i64).await?;
                let mut merged = Snapshot::default();
                for row in rows {
                    let other: Snapshot = serde_json::from_value(row.metrics.clone())
                        .with_context(|| {
                            format!(
                                "inconsistent metric types published by instance {}",
                                row.instance_id
                            )
                        })?;
                    merge_snapshots(&mut merged, other)?;
                }
                merged
            }
        };

        Ok(Some(render_prometheus(&snapshot)))
    }
}

fn merge_snapshots(into: &mut Snapshot, other: Snapshot) -> Result<()> {
    for (task, outcomes) in other.executions {
        let entry = into.executions.entry(task).or_default();
        for (outcome, histogram) in outcomes {
            entry.entry(outcome).or_default().merge(&histogram)?;
        }
    }
    for (task, count) in other.retries {
        *into.retries.entry(task).or_default() += count;
    }
    for (collection, lag) in other.change_lag_ms {
        // The leader is the only observer; last writer wins.
        into.change_lag_ms.insert(collection, lag);
    }
    for (task, at) in other.reconciled_at {
        let entry = into.reconciled_at.entry(task).or_default();
        *entry = (*entry).max(at);
    }
    // Global gauges come from the leader's snapshot.
    if other.global.is_some() {
        into.global = other.global;
    }
    Ok(())
}

fn render_prometheus(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    out.push_str("# TYPE ripple_task_executions_total counter\n");
    out.push_str("# TYPE ripple_task_execution_duration_ms histogram\n");
    for (task, outcomes) in &snapshot.executions {
        for (outcome, histogram) in outcomes {
            let _ = writeln!(
                out,
                "ripple_task_executions_total{{task=\"{task}\",status=\"{outcome}\"}} {}",
                histogram.count
            );
            let mut cumulative = 0u64;
            for (bound, count) in histogram.bounds.iter().zip(&histogram.counts) {
                cumulative += count;
                let _ = writeln!(
                    out,
                    "ripple_task_execution_duration_ms_bucket{{task=\"{task}\",status=\"{outcome}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            cumulative += histogram.counts.last().copied().unwrap_or(0);
            let _ = writeln!(
                out,
                "ripple_task_execution_duration_ms_bucket{{task=\"{task}\",status=\"{outcome}\",le=\"+Inf\"}} {cumulative}"
            );
            let _ = writeln!(
                out,
                "ripple_task_execution_duration_ms_sum{{task=\"{task}\",status=\"{outcome}\"}} {}",
                histogram.sum
            );
            let _ = writeln!(
                out,
                "ripple_task_execution_duration_ms_count{{task=\"{task}\",status=\"{outcome}\"}} {}",
                histogram.count
            );
        }
    }

    out.push_str("# TYPE ripple_task_retries_total counter\n");
    for (task, count) in &snapshot.retries {
        let _ = writeln!(out, "ripple_task_retries_total{{task=\"{task}\"}} {count}");
    }

    out.push_str("# TYPE ripple_change_stream_lag_ms gauge\n");
    for (collection, lag) in &snapshot.change_lag_ms {
        let _ = writeln!(
            out,
            "ripple_change_stream_lag_ms{{collection=\"{collection}\"}} {lag}"
        );
    }

    out.push_str("# TYPE ripple_task_reconciled_timestamp_seconds gauge\n");
    for (task, at) in &snapshot.reconciled_at {
        let _ = writeln!(
            out,
            "ripple_task_reconciled_timestamp_seconds{{task=\"{task}\"}} {at}"
        );
    }

    if let Some(global) = &snapshot.global {
        out.push_str("# TYPE ripple_task_queue_depth gauge\n");
        for (task, depth) in &global.queue_depth {
            let _ = writeln!(out, "ripple_task_queue_depth{{task=\"{task}\"}} {depth}");
        }
        out.push_str("# TYPE ripple_task_global_lag_ms gauge\n");
        for (task, lag) in &global.lag_ms {
            let _ = writeln!(out, "ripple_task_global_lag_ms{{task=\"{task}\"}} {lag}");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_totals() {
        let mut h = Histogram::default();
        h.observe(3);
        h.observe(90);
        h.observe(999_999);
        assert_eq!(h.count, 3);
        assert_eq!(h.sum, 3 + 90 + 999_999);
        assert_eq!(h.counts[0], 1);
        // 90 lands in the le=100 bucket.
        assert_eq!(h.counts[4], 1);
        // Overflow bucket.
        assert_eq!(h.counts[DURATION_BOUNDS_MS.len()], 1);
    }

    #[test]
    fn histogram_merge_requires_same_layout() {
        let mut a = Histogram::default();
        a.observe(10);
        let mut b = Histogram::default();
        b.observe(20);
        a.merge(&b).unwrap();
        assert_eq!(a.count, 2);

        let odd = Histogram {
            bounds: vec![1, 2],
            counts: vec![0, 0, 0],
            sum: 0,
            count: 0,
        };
        assert!(a.merge(&odd).is_err());
    }

    #[test]
    fn disabled_collector_records_nothing() {
        let collector = MetricsCollector::new(false, Uuid::new_v4());
        collector.record_execution("t", true, 5);
        collector.record_retry("t");
        assert_eq!(collector.local.lock().unwrap().executions.len(), 0);
    }

    #[test]
    fn snapshot_merge_sums_counters() {
        let mut a = Snapshot::default();
        a.retries.insert("t".into(), 2);
        let mut b = Snapshot::default();
        b.retries.insert("t".into(), 3);
        b.global = Some(GlobalMetrics {
            queue_depth: BTreeMap::from([("t".to_owned(), 7)]),
            lag_ms: BTreeMap::new(),
        });
        merge_snapshots(&mut a, b).unwrap();
        assert_eq!(a.retries["t"], 5);
        assert_eq!(a.global.as_ref().unwrap().queue_depth["t"], 7);
    }

    #[test]
    fn prometheus_rendering_shape() {
        let collector = MetricsCollector::new(true, Uuid::new_v4());
        collector.record_execution("index", true, 42);
        collector.record_retry("index");
        let snapshot = collector.local.lock().unwrap().clone();
        let text = render_prometheus(&snapshot);
        assert!(text.contains(
            "ripple_task_executions_total{task=\"index\",status=\"success\"} 1"
        ));
        assert!(text.contains("le=\"+Inf\"} 1"));
        assert!(text.contains("ripple_task_retries_total{task=\"index\"} 1"));
    }
}
