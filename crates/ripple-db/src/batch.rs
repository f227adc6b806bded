//! Batched processing loop used by orphan cleanup and reconciliation.
//!
//! The caller supplies a `fetch` that returns the next batch (fetching must
//! make progress on its own, e.g. by deleting processed rows or advancing a
//! checkpoint) and an `execute` that applies it. The loop stops on an empty
//! batch or when `should_stop` flips.

use anyhow::Result;

/// Counters reported by [`process_in_batches`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Total items fetched across batches.
    pub processed_documents: u64,
    /// Total operations reported by `execute`.
    pub operations_performed: u64,
}

/// Run `fetch`/`execute` until the fetch drains or `should_stop` is set.
pub async fn process_in_batches<T, FetchFn, FetchFut, ExecFn, ExecFut>(
    fetch: FetchFn,
    execute: ExecFn,
    should_stop: impl Fn() -> bool,
) -> Result<BatchOutcome>
where
    FetchFn: Fn() -> FetchFut,
    FetchFut: Future<Output = Result<Vec<T>>>,
    ExecFn: Fn(Vec<T>) -> ExecFut,
    ExecFut: Future<Output = Result<u64>>,
{
    let mut outcome = BatchOutcome::default();

    loop {
        if should_stop() {
            break;
        }

        let batch = fetch().await?;
        if batch.is_empty() {
            break;
        }

        outcome.processed_documents += batch.len() as u64;
        outcome.operations_performed += execute(batch).await?;
    }

    Ok(outcome)
}
