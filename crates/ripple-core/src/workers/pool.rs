//! Adaptive polling runner.
//!
//! One background scheduler polls every registered source collection under
//! a global concurrency budget. Each source backs off exponentially from
//! `min_poll` to `max_poll` while polls come back empty; finding a task
//! (or an external [`AdaptiveRunner::speed_up`], e.g. from the change
//! ingestor) snaps it back to `min_poll`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-source polling tuning.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub min_poll: Duration,
    pub max_poll: Duration,
    /// Fraction of the current delay added as random jitter (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            min_poll: Duration::from_millis(100),
            max_poll: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

/// Callback polling one source; returns whether a task was run.
pub type RunOne = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

struct SourceState {
    settings: PollSettings,
    delay: Duration,
    next_due: Instant,
    busy: bool,
}

struct PollDone {
    source: String,
    found: bool,
}

struct Inner {
    sources: StdMutex<HashMap<String, SourceState>>,
    semaphore: Arc<Semaphore>,
    wake: Notify,
    run_one: RunOne,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The polling worker pool.
pub struct AdaptiveRunner {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl AdaptiveRunner {
    /// `concurrency` is the global budget shared across all sources.
    pub fn new(concurrency: usize, run_one: RunOne) -> Self {
        Self {
            inner: Arc::new(Inner {
                sources: StdMutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                wake: Notify::new(),
                run_one,
            }),
            running: Mutex::new(None),
        }
    }

    /// Register a source collection for polling. Duplicate registration is
    /// an error.
    pub fn register_source(&self, name: &str, settings: PollSettings) -> Result<()> {
        let mut sources = self.inner.sources.lock().unwrap();
        if sources.contains_key(name) {
            bail!("source {name:?} is already registered");
        }
        sources.insert(
            name.to_owned(),
            SourceState {
                delay: settings.min_poll,
                next_due: Instant::now(),
                busy: false,
                settings,
            },
        );
        Ok(())
    }

    /// Snap a source back to its fastest polling rate and wake the
    /// scheduler. Unknown sources are a silent no-op.
    pub fn speed_up(&self, name: &str) {
        let mut sources = self.inner.sources.lock().unwrap();
        if let Some(state) = sources.get_mut(name) {
            state.delay = state.settings.min_poll;
            state.next_due = Instant::now();
            drop(sources);
            self.inner.wake.notify_one();
        }
    }

    /// Start the scheduler loop. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler_loop(inner, loop_cancel).await;
        });

        *running = Some(Running { cancel, handle });
        info!("worker pool started");
    }

    /// Stop the scheduler, waiting for in-flight polls to complete their
    /// current handler. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.handle.await;
        info!("worker pool stopped");
    }
}

async fn scheduler_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<PollDone>(64);
    let mut in_flight: usize = 0;

    loop {
        // Drain completions (non-blocking).
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            note_poll_result(&inner, &done);
        }

        if cancel.is_cancelled() {
            // Workers complete their current handler before shutdown.
            while in_flight > 0 {
                if let Some(done) = rx.recv().await {
                    in_flight -= 1;
                    note_poll_result(&inner, &done);
                } else {
                    break;
                }
            }
            return;
        }

        // Spawn a poll for every due, idle source.
        let now = Instant::now();
        let due: Vec<String> = {
            let mut sources = inner.sources.lock().unwrap();
            sources
                .iter_mut()
                .filter(|(_, state)| !state.busy && state.next_due <= now)
                .map(|(name, state)| {
                    state.busy = true;
                    name.clone()
                })
                .collect()
        };

        for source in due {
            in_flight += 1;
            let inner_clone = Arc::clone(&inner);
            let tx_clone = tx.clone();
            tokio::spawn(async move {
                // The budget is global: polls queue here when all permits
                // are taken.
                let permit = inner_clone
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let found = (inner_clone.run_one)(source.clone()).await;
                drop(permit);
                let _ = tx_clone.send(PollDone { source, found }).await;
            });
        }

        // Sleep until the earliest idle source is due, a poll completes,
        // a speed_up arrives, or we are cancelled.
        let next_due = {
            let sources = inner.sources.lock().unwrap();
            sources
                .values()
                .filter(|state| !state.busy)
                .map(|state| state.next_due)
                .min()
        };
        let sleep_until = next_due.unwrap_or_else(|| Instant::now() + Duration::from_millis(100));

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = inner.wake.notified() => {}
            done = rx.recv() => {
                if let Some(done) = done {
                    in_flight -= 1;
                    note_poll_result(&inner, &done);
                }
            }
            _ = tokio::time::sleep_until(sleep_until) => {}
        }
    }
}

/// Update a source's backoff after a poll: a hit snaps to `min_poll` and
/// re-polls immediately, a miss doubles the delay up to `max_poll` plus
/// jitter.
fn note_poll_result(inner: &Inner, done: &PollDone) {
    let mut sources = inner.sources.lock().unwrap();
    let Some(state) = sources.get_mut(&done.source) else {
        return;
    };
    state.busy = false;

    if done.found {
        state.delay = state.settings.min_poll;
        state.next_due = Instant::now();
        debug!(source = %done.source, "task found, polling again immediately");
    } else {
        let doubled = state.delay.saturating_mul(2).min(state.settings.max_poll);
        state.delay = doubled;
        let jitter_ms = if state.settings.jitter > 0.0 {
            let max_jitter = doubled.as_millis() as f64 * state.settings.jitter;
            rand::rng().random_range(0.0..=max_jitter.max(f64::MIN_POSITIVE)) as u64
        } else {
            0
        };
        state.next_due = Instant::now() + doubled + Duration::from_millis(jitter_ms);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter_runner(counter: Arc<AtomicUsize>, found: bool) -> RunOne {
        Arc::new(move |_source| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                found
            })
        })
    }

    #[test]
    fn duplicate_source_is_an_error() {
        let runner = AdaptiveRunner::new(2, counter_runner(Arc::new(AtomicUsize::new(0)), false));
        runner
            .register_source("orders", PollSettings::default())
            .unwrap();
        assert!(runner
            .register_source("orders", PollSettings::default())
            .is_err());
    }

    #[test]
    fn speed_up_unknown_source_is_noop() {
        let runner = AdaptiveRunner::new(2, counter_runner(Arc::new(AtomicUsize::new(0)), false));
        runner.speed_up("missing");
    }

    #[tokio::test]
    async fn polls_registered_sources() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = AdaptiveRunner::new(2, counter_runner(Arc::clone(&counter), false));
        runner
            .register_source(
                "orders",
                PollSettings {
                    min_poll: Duration::from_millis(10),
                    max_poll: Duration::from_millis(50),
                    jitter: 0.0,
                },
            )
            .unwrap();

        runner.start().await;
        // Idempotent start.
        runner.start().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        runner.stop().await;
        runner.stop().await;

        let polls = counter.load(Ordering::SeqCst);
        assert!(polls >= 2, "expected at least 2 polls, got {polls}");
    }

    #[tokio::test]
    async fn empty_polls_back_off() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = AdaptiveRunner::new(2, counter_runner(Arc::clone(&counter), false));
        runner
            .register_source(
                "orders",
                PollSettings {
                    min_poll: Duration::from_millis(5),
                    max_poll: Duration::from_millis(500),
                    jitter: 0.0,
                },
            )
            .unwrap();

        runner.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        runner.stop().await;

        // With doubling from 5ms capped at 500ms, 200ms of wall time fits
        // only a handful of polls (5+10+20+40+80+160 > 200).
        let polls = counter.load(Ordering::SeqCst);
        assert!(polls <= 8, "backoff should bound polls, got {polls}");
    }
}
