//! Reactive task engine.
//!
//! Observes JSONB document tables through a trigger-fed change log and, for
//! every document matching a task's predicate, guarantees
//! at-most-once-in-progress execution of the task handler per
//! `(task, document)` pair. Planning (debounce, dedup, the
//! `processing_dirty` protocol) happens store-side in single statements;
//! polling workers lock records with visibility timeouts; a leader-elected
//! planner ingests changes, reconciles history, and cleans up orphans.
//!
//! Entry point is [`scheduler::Scheduler`]:
//!
//! ```no_run
//! # use ripple_core::scheduler::{Scheduler, SchedulerOptions};
//! # use ripple_core::registry::ReactiveTaskSpec;
//! # use serde_json::json;
//! # async fn demo(pool: sqlx::PgPool) -> anyhow::Result<()> {
//! let scheduler = Scheduler::configure(pool, SchedulerOptions::default());
//! scheduler.reactive_task(ReactiveTaskSpec {
//!     handler: ripple_core::registry::handler(|ctx| async move {
//!         let doc = ctx.get_document().await?;
//!         tracing::info!(source_doc_id = %ctx.source_doc_id(), ?doc, "processed");
//!         Ok(())
//!     }),
//!     ..ReactiveTaskSpec::new("index_orders", "orders", json!({"status": "paid"}))
//! })?;
//! scheduler.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod duration;
pub mod election;
pub mod events;
pub mod filter;
pub mod ingest;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod workers;
