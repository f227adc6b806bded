//! Query functions for the `document_changes` log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::ChangeRow;

/// Fetch up to `limit` change rows for one collection beyond `after_seq`,
/// in sequence order.
pub async fn fetch_batch(
    pool: &PgPool,
    collection: &str,
    after_seq: i64,
    limit: i64,
) -> Result<Vec<ChangeRow>> {
    let rows = sqlx::query_as::<_, ChangeRow>(
        "SELECT * FROM document_changes \
         WHERE collection = $1 AND seq > $2 \
         ORDER BY seq ASC \
         LIMIT $3",
    )
    .bind(collection)
    .bind(after_seq)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to fetch change batch for {collection}"))?;

    Ok(rows)
}

/// Smallest retained sequence number for a collection, if any rows remain.
///
/// A persisted cursor below `min_seq - 1` means pruned history: the stream
/// cannot replay the gap and the collection's tasks need reconciliation.
pub async fn min_seq(pool: &PgPool, collection: &str) -> Result<Option<i64>> {
    let min: Option<i64> =
        sqlx::query_scalar("SELECT MIN(seq) FROM document_changes WHERE collection = $1")
            .bind(collection)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to read min change seq for {collection}"))?;

    Ok(min)
}

/// Latest sequence number across the whole log (0 when empty).
pub async fn latest_seq(pool: &PgPool, collection: &str) -> Result<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(seq) FROM document_changes WHERE collection = $1")
            .bind(collection)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to read max change seq for {collection}"))?;

    Ok(max.unwrap_or(0))
}

/// Age of the oldest unconsumed change for a collection, for stream-lag
/// metrics.
pub async fn oldest_unconsumed_at(
    pool: &PgPool,
    collection: &str,
    after_seq: i64,
) -> Result<Option<DateTime<Utc>>> {
    let at: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MIN(occurred_at) FROM document_changes \
         WHERE collection = $1 AND seq > $2",
    )
    .bind(collection)
    .bind(after_seq)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to read change-stream lag for {collection}"))?;

    Ok(at)
}

/// Delete change rows older than the retention window. Returns the number
/// of pruned rows.
pub async fn prune_older_than(pool: &PgPool, retention_ms: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM document_changes \
         WHERE occurred_at < now() - $1 * interval '1 millisecond'",
    )
    .bind(retention_ms)
    .execute(pool)
    .await
    .context("failed to prune change log")?;

    Ok(result.rows_affected())
}
