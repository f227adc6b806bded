//! Integration tests for the meta tables: change log + trigger, leader
//! lease CAS, stream cursors, reconciliation state, metrics registry.

use serde_json::json;
use uuid::Uuid;

use ripple_db::models::ChangeOp;
use ripple_db::queries::{changes, cursors, lease, metrics, reconciliations};
use ripple_test_utils::{
    create_source_fixture, create_test_db, delete_document, drop_test_db, put_document,
};

#[tokio::test]
async fn trigger_records_inserts_updates_and_deletes() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;
    put_document(&pool, &source, "doc", &json!({"v": 2})).await;
    delete_document(&pool, &source, "doc").await;

    let rows = changes::fetch_batch(&pool, "orders", 0, 10).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].op, ChangeOp::Insert);
    assert_eq!(rows[1].op, ChangeOp::Update);
    assert_eq!(rows[2].op, ChangeOp::Delete);
    assert!(rows.iter().all(|r| r.doc_id == "doc"));
    // Sequence numbers are strictly increasing.
    assert!(rows[0].seq < rows[1].seq && rows[1].seq < rows[2].seq);

    // Batch fetch respects the cursor.
    let tail = changes::fetch_batch(&pool, "orders", rows[1].seq, 10)
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].op, ChangeOp::Delete);

    assert_eq!(changes::latest_seq(&pool, "orders").await.unwrap(), rows[2].seq);
    assert_eq!(changes::min_seq(&pool, "orders").await.unwrap(), Some(rows[0].seq));

    drop_test_db(&db).await;
}

#[tokio::test]
async fn change_log_pruning() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;

    // Nothing is old enough yet.
    assert_eq!(changes::prune_older_than(&pool, 60_000).await.unwrap(), 0);
    // Everything is older than "now".
    assert_eq!(changes::prune_older_than(&pool, 0).await.unwrap(), 1);
    assert_eq!(changes::min_seq(&pool, "orders").await.unwrap(), None);

    drop_test_db(&db).await;
}

#[tokio::test]
async fn lease_is_single_holder() {
    let (pool, db) = create_test_db().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    assert!(lease::try_acquire(&pool, a, 60_000).await.unwrap());
    // A second instance cannot take an unexpired lease.
    assert!(!lease::try_acquire(&pool, b, 60_000).await.unwrap());
    // Re-acquisition by the holder extends.
    assert!(lease::try_acquire(&pool, a, 60_000).await.unwrap());

    // Heartbeats only work for the holder.
    assert!(lease::heartbeat(&pool, a, 60_000).await.unwrap());
    assert!(!lease::heartbeat(&pool, b, 60_000).await.unwrap());

    let current = lease::current_leader(&pool).await.unwrap().unwrap();
    assert_eq!(current.instance_id, a);

    // Release opens the door for the other instance.
    lease::release(&pool, a).await.unwrap();
    assert!(lease::try_acquire(&pool, b, 60_000).await.unwrap());
    assert!(!lease::heartbeat(&pool, a, 60_000).await.unwrap());

    drop_test_db(&db).await;
}

#[tokio::test]
async fn expired_lease_can_be_taken() {
    let (pool, db) = create_test_db().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    // TTL 0: expires immediately.
    assert!(lease::try_acquire(&pool, a, 0).await.unwrap());
    assert!(lease::try_acquire(&pool, b, 60_000).await.unwrap());
    assert!(!lease::heartbeat(&pool, a, 60_000).await.unwrap());

    drop_test_db(&db).await;
}

#[tokio::test]
async fn cursors_roundtrip() {
    let (pool, db) = create_test_db().await;

    assert_eq!(cursors::get(&pool, "orders").await.unwrap(), None);
    cursors::set(&pool, "orders", 41).await.unwrap();
    cursors::set(&pool, "orders", 42).await.unwrap();
    assert_eq!(cursors::get(&pool, "orders").await.unwrap(), Some(42));

    drop_test_db(&db).await;
}

#[tokio::test]
async fn reconciliation_signature_lifecycle() {
    let (pool, db) = create_test_db().await;

    // First registration flags a pending reconciliation.
    let pending = reconciliations::ensure(&pool, "t", "orders", "sig-1", Some("v1"))
        .await
        .unwrap();
    assert!(pending);

    // An interrupted scan resumes from its checkpoint under the same
    // signature.
    reconciliations::set_checkpoint(&pool, "t", "doc-500").await.unwrap();
    let still_pending = reconciliations::ensure(&pool, "t", "orders", "sig-1", Some("v1"))
        .await
        .unwrap();
    assert!(still_pending);
    let row = reconciliations::get(&pool, "t").await.unwrap().unwrap();
    assert_eq!(row.checkpoint_id.as_deref(), Some("doc-500"));

    // Completion clears the checkpoint.
    reconciliations::complete(&pool, "t").await.unwrap();
    let done = reconciliations::ensure(&pool, "t", "orders", "sig-1", Some("v1"))
        .await
        .unwrap();
    assert!(!done);

    // A signature change restarts the scan from zero.
    let pending = reconciliations::ensure(&pool, "t", "orders", "sig-2", Some("v2"))
        .await
        .unwrap();
    assert!(pending);
    let row = reconciliations::get(&pool, "t").await.unwrap().unwrap();
    assert_eq!(row.checkpoint_id, None);
    assert_eq!(row.signature, "sig-2");

    // A history gap re-flags and clears the checkpoint.
    reconciliations::complete(&pool, "t").await.unwrap();
    reconciliations::set_checkpoint(&pool, "t", "doc-9").await.unwrap();
    reconciliations::flag_gap(&pool, "t").await.unwrap();
    let row = reconciliations::get(&pool, "t").await.unwrap().unwrap();
    assert!(!row.completed);
    assert_eq!(row.checkpoint_id, None);

    let pending_rows = reconciliations::list_pending(&pool).await.unwrap();
    assert_eq!(pending_rows.len(), 1);

    drop_test_db(&db).await;
}

#[tokio::test]
async fn signature_only_update_does_not_flag() {
    let (pool, db) = create_test_db().await;

    reconciliations::ensure(&pool, "t", "orders", "sig-1", None)
        .await
        .unwrap();
    reconciliations::complete(&pool, "t").await.unwrap();

    reconciliations::set_signature(&pool, "t", "orders", "sig-2", None)
        .await
        .unwrap();
    let row = reconciliations::get(&pool, "t").await.unwrap().unwrap();
    assert!(row.completed, "signature-only update must not flag a re-scan");
    assert_eq!(row.signature, "sig-2");

    drop_test_db(&db).await;
}

#[tokio::test]
async fn metrics_registry_upsert_and_prune() {
    let (pool, db) = create_test_db().await;
    let me = Uuid::new_v4();
    let stale = Uuid::new_v4();

    metrics::upsert_instance(&pool, me, &json!({"retries": {"t": 1}}))
        .await
        .unwrap();
    metrics::upsert_instance(&pool, stale, &json!({}))
        .await
        .unwrap();

    // Age the second instance beyond the staleness window.
    sqlx::query(
        "UPDATE metrics_instances SET last_seen = now() - interval '1 minute' \
         WHERE instance_id = $1",
    )
    .bind(stale)
    .execute(&pool)
    .await
    .unwrap();

    let live = metrics::list_live(&pool, 10_000).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].instance_id, me);

    let pruned = metrics::prune_stale(&pool, 10_000).await.unwrap();
    assert_eq!(pruned, 1);

    drop_test_db(&db).await;
}
