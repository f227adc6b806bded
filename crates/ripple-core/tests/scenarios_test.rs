//! End-to-end scenarios: a full scheduler against a containerized
//! Postgres, with tightened timings so the planner, workers, and cleanup
//! all cycle within a test's patience.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use ripple_core::duration::DurationInput;
use ripple_core::ingest::PlannerOptions;
use ripple_core::registry::{handler, ReactiveTaskSpec};
use ripple_core::retry::RetryPolicy;
use ripple_core::scheduler::{ReactiveTaskQuery, Scheduler, SchedulerOptions};
use ripple_core::workers::PollSettings;
use ripple_db::models::{CleanupMode, TaskStatus};
use ripple_db::queries::tasks;
use ripple_test_utils::{
    create_source_fixture, create_test_db, delete_document, drop_test_db, put_document,
};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn fast_options() -> SchedulerOptions {
    init_tracing();
    SchedulerOptions {
        concurrency: 5,
        visibility_timeout: Duration::from_secs(30),
        poll: PollSettings {
            min_poll: Duration::from_millis(20),
            max_poll: Duration::from_millis(200),
            jitter: 0.0,
        },
        planner: PlannerOptions {
            change_poll_interval: Duration::from_millis(100),
            change_batch_size: 100,
            change_retention: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_millis(500),
            reconcile_batch_size: 100,
        },
        lease_ttl: Duration::from_secs(3),
        metrics_flush_interval: Duration::from_millis(500),
        ..SchedulerOptions::default()
    }
}

/// Shared run log: (source_doc_id, watched_values) per completed handler
/// invocation, plus a counter incremented at invocation start.
#[derive(Clone, Default)]
struct Capture {
    started: Arc<AtomicUsize>,
    runs: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Capture {
    fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    fn runs_for(&self, doc: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == doc)
            .count()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll an async `condition` until it holds or `timeout` elapses.
async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn processes_existing_and_new_documents() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    // Present before the scheduler ever starts: reconciliation territory.
    put_document(&pool, &source, "pre", &json!({"status": "A"})).await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), ctx.watched_values().clone()));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("index", "orders", json!({"status": "A"}))
        })
        .unwrap();

    scheduler.start().await.unwrap();
    // Idempotent start.
    scheduler.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || capture.runs_for("pre") == 1).await,
        "pre-existing document must be processed via reconciliation"
    );

    // Stream territory.
    put_document(&pool, &source, "live", &json!({"status": "A"})).await;
    assert!(
        wait_until(Duration::from_secs(5), || capture.runs_for("live") == 1).await,
        "live insert must be processed via the change stream"
    );

    // Non-matching documents are ignored.
    put_document(&pool, &source, "other", &json!({"status": "Z"})).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(capture.runs_for("other"), 0);

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s1_filter_widening_reprocesses_history() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let record_run = move |ctx: ripple_core::workers::TaskContext| {
        let cap = cap.clone();
        async move {
            cap.runs
                .lock()
                .unwrap()
                .push((ctx.source_doc_id().to_owned(), ctx.watched_values().clone()));
            Ok(())
        }
    };

    // V1: only status A.
    let v1 = Scheduler::configure(pool.clone(), fast_options());
    v1.reactive_task(ReactiveTaskSpec {
        handler: handler(record_run.clone()),
        ..ReactiveTaskSpec::new("widen", "orders", json!({"status": "A"}))
    })
    .unwrap();
    v1.start().await.unwrap();

    put_document(&pool, &source, "docA", &json!({"status": "A"})).await;
    put_document(&pool, &source, "docB", &json!({"status": "B"})).await;

    assert!(wait_until(Duration::from_secs(5), || capture.runs_for("docA") == 1).await);
    assert_eq!(capture.runs_for("docB"), 0);

    v1.stop().await;

    // V2: the filter widens; the signature change forces reconciliation.
    let v2 = Scheduler::configure(pool.clone(), fast_options());
    v2.reactive_task(ReactiveTaskSpec {
        handler: handler(record_run),
        ..ReactiveTaskSpec::new("widen", "orders", json!({"status": {"$in": ["A", "B"]}}))
    })
    .unwrap();
    v2.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || capture.runs_for("docB") == 1).await,
        "docB must be picked up after the filter widens"
    );

    v2.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s2_update_mid_run_causes_exactly_one_follow_up() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    cap.started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), ctx.watched_values().clone()));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("dirty", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "d", &json!({"v": 1})).await;

    // Wait for the first invocation to be in flight, then mutate.
    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.started.load(Ordering::SeqCst) == 1).await);
    put_document(&pool, &source, "d", &json!({"v": 2})).await;

    // Exactly one follow-up run, seeing the new value.
    let cap = capture.clone();
    assert!(
        wait_until(Duration::from_secs(5), || cap.run_count() == 2).await,
        "a mutation observed while processing causes one follow-up"
    );
    {
        let runs = capture.runs.lock().unwrap();
        assert_eq!(runs[1].1, json!({"v": 2}));
    }

    // And no third.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(capture.run_count(), 2);

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s3_retries_until_permanent_failure() {
    let (pool, db) = create_test_db().await;
    let (source, table) = create_source_fixture(&pool, "orders").await;

    let attempts_seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts_seen);
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            retry: RetryPolicy::Fixed {
                interval: DurationInput(Duration::from_millis(50)),
                max_attempts: Some(3),
                max_duration: None,
            },
            handler: handler(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("synthetic handler failure")
                }
            }),
            ..ReactiveTaskSpec::new("dlq", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;

    let counter = Arc::clone(&attempts_seen);
    assert!(
        wait_until(Duration::from_secs(10), || {
            counter.load(Ordering::SeqCst) == 3
        })
        .await,
        "handler must run exactly max_attempts times"
    );

    // Let any extra (incorrect) retry fire before checking the record.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts_seen.load(Ordering::SeqCst), 3);

    let record = tasks::get_by_source(&pool, &table, "dlq", "doc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.next_run_at.is_none());
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .contains("synthetic handler failure"));
    assert!(record.first_error_at.is_some());

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s5_defer_reschedules_without_finalizing() {
    let (pool, db) = create_test_db().await;
    let (source, table) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    let first = cap.started.fetch_add(1, Ordering::SeqCst) == 0;
                    if first {
                        ctx.defer_current(Duration::from_millis(1000));
                    } else {
                        cap.runs
                            .lock()
                            .unwrap()
                            .push((ctx.source_doc_id().to_owned(), Value::Null));
                    }
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("deferred", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    let inserted_at = Utc::now();
    put_document(&pool, &source, "doc", &json!({"v": 1})).await;

    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.started.load(Ordering::SeqCst) == 1).await);

    // The record is back to pending roughly a second out, attempts reset.
    assert!(
        wait_for(Duration::from_secs(2), || async {
            tasks::get_by_source(&pool, &table, "deferred", "doc")
                .await
                .ok()
                .flatten()
                .is_some_and(|r| r.status == TaskStatus::Pending && r.attempts == 0)
        })
        .await
    );

    // The handler runs again after the deferral elapses.
    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.run_count() == 1).await);
    let elapsed = Utc::now() - inserted_at;
    assert!(
        elapsed.num_milliseconds() >= 1000,
        "second run must come after the deferral delay"
    );

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s6_throttle_postpones_other_records_of_the_task() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    if cap.started.fetch_add(1, Ordering::SeqCst) == 0 {
                        ctx.throttle_all(Duration::from_millis(2000));
                    }
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), Utc::now().timestamp_millis().into()));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("throttled", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "first", &json!({"v": 1})).await;
    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.runs_for("first") == 1).await);
    let throttled_at = Utc::now();

    put_document(&pool, &source, "second", &json!({"v": 1})).await;

    let cap = capture.clone();
    assert!(
        wait_until(Duration::from_secs(4), || cap.runs_for("second") == 1).await,
        "the second record must eventually run"
    );
    let waited = (Utc::now() - throttled_at).num_milliseconds();
    assert!(
        waited >= 1900,
        "second record ran after only {waited}ms despite the throttle"
    );

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn s7_orphaned_records_are_deleted() {
    let (pool, db) = create_test_db().await;
    let (source, table) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            delete_when: CleanupMode::SourceDocumentDeleted,
            keep_for: Duration::ZERO,
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), Value::Null));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("cleanup", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;
    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.runs_for("doc") == 1).await);

    delete_document(&pool, &source, "doc").await;

    assert!(
        wait_for(Duration::from_secs(5), || async {
            tasks::get_by_source(&pool, &table, "cleanup", "doc")
                .await
                .ok()
                .flatten()
                .is_none()
        })
        .await,
        "the orphaned record must be removed by cleanup"
    );

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn debounce_coalesces_update_bursts() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            debounce: Duration::from_millis(400),
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), ctx.watched_values().clone()));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("debounced", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    for v in 1..=4 {
        put_document(&pool, &source, "doc", &json!({"v": v})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.run_count() >= 1).await);
    tokio::time::sleep(Duration::from_millis(800)).await;

    // The burst coalesced into one run, seeing the final value.
    assert_eq!(capture.run_count(), 1);
    {
        let runs = capture.runs.lock().unwrap();
        assert_eq!(runs[0].1, json!({"v": 4}));
    }

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn admin_surface_lists_counts_retries_and_scrapes() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            retry: RetryPolicy::Fixed {
                interval: DurationInput(Duration::from_secs(3600)),
                max_attempts: Some(1),
                max_duration: None,
            },
            handler: handler(|_ctx| async { anyhow::bail!("always fails") }),
            ..ReactiveTaskSpec::new("admin", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;

    let failed_query = ReactiveTaskQuery {
        task: Some("admin".to_owned()),
        status: Some("failed".to_owned()),
        ..Default::default()
    };
    assert!(
        wait_for(Duration::from_secs(5), || async {
            scheduler.count_reactive_tasks(&failed_query).await.unwrap_or(0) == 1
        })
        .await
    );

    let records = scheduler.get_reactive_tasks(&failed_query, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].last_error.as_deref().unwrap().contains("always fails"));

    let info = scheduler.get_reactive_task_info().await.unwrap();
    assert!(info.is_leader);
    assert_eq!(info.leader, Some(scheduler.instance_id()));
    assert_eq!(info.statistics.len(), 1);
    assert_eq!(info.statistics[0].failed, 1);

    // Retrying resets the failed record; it fails again on its new run.
    let retried = scheduler.retry_reactive_tasks(&failed_query).await.unwrap();
    assert_eq!(retried, 1);

    assert!(
        wait_for(Duration::from_secs(5), || async {
            scheduler
                .get_reactive_tasks(
                    &ReactiveTaskQuery {
                        task: Some("admin".to_owned()),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .map(|records| records.first().is_some_and(|r| r.attempts >= 2))
                .unwrap_or(false)
        })
        .await
    );

    let text = scheduler
        .prometheus_metrics(ripple_core::metrics::ScrapeMode::Local)
        .await
        .unwrap()
        .expect("monitoring is enabled");
    assert!(text.contains("ripple_task_executions_total"));

    scheduler.stop().await;
    drop_test_db(&db).await;
}

#[tokio::test]
async fn manual_trigger_replans_an_unchanged_document() {
    let (pool, db) = create_test_db().await;
    let (source, _) = create_source_fixture(&pool, "orders").await;

    let capture = Capture::default();
    let cap = capture.clone();
    let scheduler = Scheduler::configure(pool.clone(), fast_options());
    scheduler
        .reactive_task(ReactiveTaskSpec {
            handler: handler(move |ctx| {
                let cap = cap.clone();
                async move {
                    cap.runs
                        .lock()
                        .unwrap()
                        .push((ctx.source_doc_id().to_owned(), Value::Null));
                    Ok(())
                }
            }),
            ..ReactiveTaskSpec::new("manual", "orders", json!({}))
        })
        .unwrap();
    scheduler.start().await.unwrap();

    put_document(&pool, &source, "doc", &json!({"v": 1})).await;
    let cap = capture.clone();
    assert!(wait_until(Duration::from_secs(5), || cap.runs_for("doc") == 1).await);

    scheduler.trigger_task("manual", "doc").await.unwrap();

    let cap = capture.clone();
    assert!(
        wait_until(Duration::from_secs(5), || cap.runs_for("doc") == 2).await,
        "a manual trigger must force a run without a data change"
    );

    assert!(scheduler.trigger_task("unknown", "doc").await.is_err());

    scheduler.stop().await;
    drop_test_db(&db).await;
}
