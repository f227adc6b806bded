//! Query functions for the shared `metrics_instances` registry.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::MetricsInstanceRow;

/// Publish this instance's local snapshot, refreshing `last_seen`.
pub async fn upsert_instance(pool: &PgPool, instance_id: Uuid, metrics: &Value) -> Result<()> {
    sqlx::query(
        "INSERT INTO metrics_instances (instance_id, last_seen, metrics) \
         VALUES ($1, now(), $2) \
         ON CONFLICT (instance_id) DO UPDATE \
         SET last_seen = now(), metrics = EXCLUDED.metrics",
    )
    .bind(instance_id)
    .bind(metrics)
    .execute(pool)
    .await
    .context("failed to publish metrics snapshot")?;

    Ok(())
}

/// Snapshots of all instances seen within the staleness window.
pub async fn list_live(pool: &PgPool, staleness_ms: i64) -> Result<Vec<MetricsInstanceRow>> {
    let rows = sqlx::query_as::<_, MetricsInstanceRow>(
        "SELECT instance_id, last_seen, metrics FROM metrics_instances \
         WHERE last_seen >= now() - $1 * interval '1 millisecond' \
         ORDER BY instance_id",
    )
    .bind(staleness_ms)
    .fetch_all(pool)
    .await
    .context("failed to list live metrics instances")?;

    Ok(rows)
}

/// Drop snapshots of instances not seen within the staleness window
/// (leader only). Returns the number of pruned rows.
pub async fn prune_stale(pool: &PgPool, staleness_ms: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM metrics_instances \
         WHERE last_seen < now() - $1 * interval '1 millisecond'",
    )
    .bind(staleness_ms)
    .execute(pool)
    .await
    .context("failed to prune stale metrics instances")?;

    Ok(result.rows_affected())
}
