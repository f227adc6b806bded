//! Connection pooling and schema migrations.
//!
//! A scheduler instance holds connections beyond its worker budget: the
//! change listener keeps a dedicated LISTEN session, the planner runs its
//! drain and reconciliation statements, and the metrics loop publishes
//! snapshots. Pool sizing accounts for those, so a saturated worker pool
//! cannot starve the leader loops.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connections reserved for the background loops (listener, planner,
/// metrics) on top of the worker concurrency budget.
const SERVICE_CONNECTIONS: u32 = 3;

/// Resolve the database URL from `RIPPLE_DATABASE_URL`, falling back to a
/// local default.
pub fn database_url_from_env() -> String {
    env::var("RIPPLE_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost:5432/ripple".to_owned())
}

/// Open a pool sized for one scheduler instance running `concurrency`
/// concurrent workers.
pub async fn connect(url: &str, concurrency: usize) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(concurrency as u32 + SERVICE_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(pool)
}

/// Apply pending migrations for the meta tables (change log, leader
/// lease, cursors, reconciliations, metrics registry).
///
/// Tasks tables are not migrated here; they depend on registered source
/// collections and are provisioned at `start()` by
/// [`crate::queries::schema`]. Loading the migrator at runtime keeps the
/// build independent of a live database (no `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", migrations_dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to apply meta-table migrations")?;

    info!("meta-table migrations applied");
    Ok(())
}

/// Path of the migrations directory shipped with this crate, resolved at
/// compile time relative to the crate source tree.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_resolution_yields_a_connection_url() {
        // Either the env override or the local fallback; both are URLs.
        let url = database_url_from_env();
        assert!(url.contains("://"));
    }

    #[test]
    fn migrations_path_points_into_the_crate() {
        let path = default_migrations_path();
        assert!(path.ends_with("migrations"));
    }
}
