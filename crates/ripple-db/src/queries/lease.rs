//! Query functions for the singleton `leader_lease` row.
//!
//! All transitions are compare-and-swap updates so that two instances can
//! never both believe they hold the lease.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::LeaderLease;

/// Try to take the lease: succeeds when the lease is absent, expired, or
/// already ours. Returns `true` when this instance is now the leader.
pub async fn try_acquire(pool: &PgPool, instance_id: Uuid, ttl_ms: i64) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO leader_lease (id, instance_id, expires_at) \
         VALUES (1, $1, now() + $2 * interval '1 millisecond') \
         ON CONFLICT (id) DO UPDATE \
         SET instance_id = EXCLUDED.instance_id, expires_at = EXCLUDED.expires_at \
         WHERE leader_lease.expires_at <= now() OR leader_lease.instance_id = $1",
    )
    .bind(instance_id)
    .bind(ttl_ms)
    .execute(pool)
    .await
    .context("failed to acquire leader lease")?;

    Ok(result.rows_affected() == 1)
}

/// Re-assert ownership. Only extends the lease if this instance still
/// holds it. Returns `false` when the lease was lost.
pub async fn heartbeat(pool: &PgPool, instance_id: Uuid, ttl_ms: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE leader_lease \
         SET expires_at = now() + $2 * interval '1 millisecond' \
         WHERE id = 1 AND instance_id = $1",
    )
    .bind(instance_id)
    .bind(ttl_ms)
    .execute(pool)
    .await
    .context("failed to heartbeat leader lease")?;

    Ok(result.rows_affected() == 1)
}

/// Give up the lease if we hold it, letting another instance acquire it
/// immediately.
pub async fn release(pool: &PgPool, instance_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE leader_lease SET expires_at = now() \
         WHERE id = 1 AND instance_id = $1",
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("failed to release leader lease")?;

    Ok(())
}

/// Current lease holder, if the lease is unexpired.
pub async fn current_leader(pool: &PgPool) -> Result<Option<LeaderLease>> {
    let lease = sqlx::query_as::<_, LeaderLease>(
        "SELECT instance_id, expires_at FROM leader_lease \
         WHERE id = 1 AND expires_at > now()",
    )
    .fetch_optional(pool)
    .await
    .context("failed to read leader lease")?;

    Ok(lease)
}
