//! Test fixtures for ripple integration tests.
//!
//! Tests run against one PostgreSQL server (an external one when
//! `RIPPLE_TEST_PG_URL` is set, otherwise a container started once per
//! test binary) and isolate themselves with a throwaway database each,
//! created with the meta-table migrations applied and a `(id, doc)`
//! source fixture helper.

use std::env;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use ripple_db::pool;
use ripple_db::queries::{schema, TableName};

/// The server every test database is created on. The container handle is
/// held for the lifetime of the test binary; with an external URL there
/// is nothing to hold.
struct PgServer {
    root_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(root_url) = env::var("RIPPLE_TEST_PG_URL") {
                return PgServer {
                    root_url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("16")
                .start()
                .await
                .expect("failed to start the PostgreSQL test container");
            let host = container.get_host().await.expect("container has no host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container exposes no 5432 mapping");

            PgServer {
                root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// One administrative connection to the server's `postgres` database, for
/// CREATE/DROP DATABASE statements that cannot run inside a pool.
async fn admin_connection(root_url: &str) -> PgConnection {
    PgConnection::connect(&format!("{root_url}/postgres"))
        .await
        .expect("failed to open an admin connection")
}

/// Create a throwaway database with migrations applied.
///
/// Returns the pool plus the database name to hand back to
/// [`drop_test_db`] at the end of the test.
pub async fn create_test_db() -> (PgPool, String) {
    let server = server().await;
    let db_name = format!("ripple_test_{}", Uuid::new_v4().simple());

    let mut admin = admin_connection(&server.root_url).await;
    admin
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create {db_name}: {e}"));
    let _ = admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&format!("{}/{db_name}", server.root_url))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {db_name}: {e}"));

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("meta-table migrations should apply cleanly");

    (pool, db_name)
}

/// Drop a throwaway database. `WITH (FORCE)` evicts any connection the
/// test left open, so cleanup never hangs on a straggling pool.
pub async fn drop_test_db(db_name: &str) {
    let server = server().await;
    let mut admin = admin_connection(&server.root_url).await;
    let _ = admin
        .execute(format!("DROP DATABASE IF EXISTS {db_name} WITH (FORCE)").as_str())
        .await;
    let _ = admin.close().await;
}

/// Create a `(id TEXT, doc JSONB)` source table with the change trigger
/// attached, plus its tasks table. Returns the two table names.
pub async fn create_source_fixture(pool: &PgPool, source: &str) -> (TableName, TableName) {
    let source_table = TableName::new(source).expect("valid source name");
    let tasks_table = TableName::new(format!("{source}_tasks")).expect("valid tasks name");

    let create = format!(
        "CREATE TABLE IF NOT EXISTS {source_table} ( \
             id TEXT PRIMARY KEY, \
             doc JSONB NOT NULL \
         )"
    );
    pool.execute(create.as_str())
        .await
        .expect("failed to create source table");

    schema::ensure_source_trigger(pool, &source_table)
        .await
        .expect("failed to attach change trigger");
    schema::ensure_tasks_table(pool, &tasks_table)
        .await
        .expect("failed to create tasks table");

    (source_table, tasks_table)
}

/// Insert or replace a document in a source fixture table.
pub async fn put_document(pool: &PgPool, source: &TableName, id: &str, doc: &Value) {
    let stmt = format!(
        "INSERT INTO {source} (id, doc) VALUES ($1, $2) \
         ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc"
    );
    sqlx::query(&stmt)
        .bind(id)
        .bind(doc)
        .execute(pool)
        .await
        .expect("failed to upsert document");
}

/// Delete a document from a source fixture table.
pub async fn delete_document(pool: &PgPool, source: &TableName, id: &str) {
    let stmt = format!("DELETE FROM {source} WHERE id = $1");
    sqlx::query(&stmt)
        .bind(id)
        .execute(pool)
        .await
        .expect("failed to delete document");
}
