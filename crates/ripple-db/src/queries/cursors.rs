//! Query functions for the per-collection `stream_cursors` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Last consumed change-log seq for a collection, if any was persisted.
pub async fn get(pool: &PgPool, collection: &str) -> Result<Option<i64>> {
    let seq: Option<i64> =
        sqlx::query_scalar("SELECT seq FROM stream_cursors WHERE collection = $1")
            .bind(collection)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to read stream cursor for {collection}"))?;

    Ok(seq)
}

/// Persist the consumed position for a collection.
pub async fn set(pool: &PgPool, collection: &str, seq: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO stream_cursors (collection, seq, updated_at) \
         VALUES ($1, $2, now()) \
         ON CONFLICT (collection) DO UPDATE \
         SET seq = EXCLUDED.seq, updated_at = now()",
    )
    .bind(collection)
    .bind(seq)
    .execute(pool)
    .await
    .with_context(|| format!("failed to persist stream cursor for {collection}"))?;

    Ok(())
}
