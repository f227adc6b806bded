//! TTL-lease leader election over the shared store.
//!
//! One instance at a time runs the change ingestor, reconciliation, and
//! global maintenance. The lease lives in the singleton `leader_lease` row;
//! acquisition and heartbeats are compare-and-swap updates, so a partitioned
//! ex-leader can never extend a lease it already lost.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ripple_db::queries::lease;

use crate::events::Sinks;

/// Default lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    pool: PgPool,
    instance_id: Uuid,
    ttl: Duration,
    sinks: Sinks,
    is_leader: watch::Sender<bool>,
    /// After a forced loss, acquisition pauses until this instant so
    /// another instance gets a full TTL to take over.
    suspended_until: StdMutex<Option<Instant>>,
}

/// Single-writer election with heartbeats at `ttl / 3`.
pub struct LeaderElector {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl LeaderElector {
    pub fn new(pool: PgPool, instance_id: Uuid, ttl: Duration, sinks: Sinks) -> Self {
        let (is_leader, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pool,
                instance_id,
                ttl,
                sinks,
                is_leader,
                suspended_until: StdMutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Observe leadership transitions. The current value is delivered
    /// immediately on first read.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.is_leader.subscribe()
    }

    /// Whether this instance currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        *self.inner.is_leader.borrow()
    }

    /// Start the election loop. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            election_loop(inner, loop_cancel).await;
        });

        *running = Some(Running { cancel, handle });
    }

    /// Stop the loop and release the lease gracefully. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.handle.await;

        if self.is_leader() {
            if let Err(err) = lease::release(&self.inner.pool, self.inner.instance_id).await {
                self.inner.sinks.error(&err);
            }
            self.inner.is_leader.send_replace(false);
            info!(instance_id = %self.inner.instance_id, "released leadership on stop");
        }
    }

    /// Surrender leadership immediately (unrecoverable planner errors).
    ///
    /// Releases the lease, notifies observers, and pauses re-acquisition
    /// for one TTL so another instance can take over.
    pub async fn force_lose_leader(&self) {
        let inner = &self.inner;
        if let Err(err) = lease::release(&inner.pool, inner.instance_id).await {
            inner.sinks.error(&err);
        }
        *inner.suspended_until.lock().unwrap() = Some(Instant::now() + inner.ttl);
        if inner.is_leader.send_replace(false) {
            warn!(instance_id = %inner.instance_id, "leadership surrendered");
        }
    }
}

async fn election_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let ttl_ms = inner.ttl.as_millis() as i64;
    let beat = inner.ttl / 3;

    loop {
        let was_leader = *inner.is_leader.borrow();

        let suspended = inner
            .suspended_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until);

        if !suspended {
            let outcome = if was_leader {
                lease::heartbeat(&inner.pool, inner.instance_id, ttl_ms).await
            } else {
                lease::try_acquire(&inner.pool, inner.instance_id, ttl_ms).await
            };

            match outcome {
                Ok(holding) => {
                    if holding != was_leader {
                        if holding {
                            info!(instance_id = %inner.instance_id, "acquired leadership");
                        } else {
                            warn!(instance_id = %inner.instance_id, "lost leadership");
                        }
                        inner.is_leader.send_replace(holding);
                    } else {
                        debug!(leader = holding, "election tick");
                    }
                }
                Err(err) => {
                    // A store hiccup while leading must demote us: we can
                    // no longer prove the lease is ours.
                    inner.sinks.error(&err);
                    if was_leader {
                        inner.is_leader.send_replace(false);
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(beat) => {}
        }
    }
}

/// Current leader as recorded in the store, for diagnostics.
pub async fn current_leader(pool: &PgPool) -> Result<Option<Uuid>> {
    Ok(lease::current_leader(pool).await?.map(|l| l.instance_id))
}
