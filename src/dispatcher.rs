//! One admission-controlled dispatch iteration.
//!
//! Each call to [`handle`]:
//! 1. enumerates the key store,
//! 2. reclaims orphaned leases,
//! 3. computes open slots as `concurrency - active`,
//! 4. claims backlog keys into those slots and runs the callback for each,
//! 5. waits for every task it launched before returning.
//!
//! Slot accounting is per process. Replicas racing on the same backlog each
//! honor their own ceiling; there is no global cap.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::keystore::{KeyStore, QueuedKey, Snapshot};
use crate::telemetry::work::{record_state_transition, start_dispatch_span, start_key_span};

/// Processes one claimed key.
///
/// `Ok` completes the key; `Err` puts it back in the backlog for a later
/// iteration.
#[async_trait]
pub trait Callback: Send + Sync + 'static {
    async fn process(&self, key: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Callback for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, key: &str) -> anyhow::Result<()> {
        (self)(key.to_string()).await
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Healthy leases found at enumeration, each occupying a slot.
    pub active: usize,
    /// Orphaned leases returned to the backlog.
    pub orphans_requeued: usize,
    /// Claim attempts launched (slots reserved).
    pub launched: usize,
    /// Claims that lost to another dispatcher.
    pub lost_races: usize,
    /// Claims that failed for reasons other than a lost race.
    pub failed_starts: usize,
    /// Keys whose callback succeeded and were completed.
    pub completed: usize,
    /// Keys whose callback failed and were requeued.
    pub requeued: usize,
}

#[derive(Debug)]
enum KeyOutcome {
    LostRace,
    StartFailed,
    Completed,
    Requeued,
}

/// Run one dispatch iteration against `store`.
///
/// Returns an error only for storage-level problems: a failed enumeration,
/// a failed orphan requeue, a failed requeue after a callback error, or a
/// failed completion. Callback errors and lost claim races are absorbed.
/// Even when a task fails, every launched task is joined before returning.
pub async fn handle(
    store: &KeyStore,
    concurrency: usize,
    callback: Arc<dyn Callback>,
) -> Result<DispatchReport> {
    let span = start_dispatch_span(concurrency);
    dispatch(store, concurrency, callback, span.clone())
        .instrument(span)
        .await
}

async fn dispatch(
    store: &KeyStore,
    concurrency: usize,
    callback: Arc<dyn Callback>,
    span: tracing::Span,
) -> Result<DispatchReport> {
    let Snapshot {
        in_progress,
        queued,
    } = store.enumerate().await?;

    let mut report = DispatchReport::default();

    // Return orphaned work to the queue; everything else holds a slot.
    let mut active: HashSet<String> = HashSet::with_capacity(in_progress.len());
    for lease in in_progress {
        if !lease.is_orphaned() {
            active.insert(lease.name().to_string());
            continue;
        }
        let key = lease.name().to_string();
        info!(key, last_heartbeat = %lease.last_heartbeat(), "requeuing orphaned lease");
        if let Err(e) = lease.requeue().await {
            error!(key, error = %e, "failed to requeue orphaned lease");
            return Err(e);
        }
        report.orphans_requeued += 1;
    }
    report.active = active.len();

    let open_slots = concurrency.saturating_sub(active.len());
    let mut tasks = JoinSet::new();
    for candidate in queued {
        if report.launched >= open_slots {
            break;
        }
        // Claimed but not yet removed from the backlog.
        if active.contains(candidate.name()) {
            continue;
        }

        // Reserve the slot before the claim runs, so concurrent claims in
        // this iteration can never overshoot. A lost race leaves the slot
        // unused until the next iteration.
        report.launched += 1;

        let key_span = start_key_span(candidate.name());
        tasks.spawn(
            run_key(candidate, Arc::clone(&callback), key_span.clone()).instrument(key_span),
        );
    }
    span.record("dispatch.launched", report.launched);
    info!(
        launched = report.launched,
        active = report.active,
        "launched new keys"
    );

    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(outcome)) => match outcome {
                KeyOutcome::LostRace => report.lost_races += 1,
                KeyOutcome::StartFailed => report.failed_starts += 1,
                KeyOutcome::Completed => report.completed += 1,
                KeyOutcome::Requeued => report.requeued += 1,
            },
            Ok(Err(e)) => {
                error!(error = %e, "dispatch task failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "dispatch task panicked");
                first_error.get_or_insert(Error::Other(format!("dispatch task panicked: {e}")));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

async fn run_key(
    candidate: QueuedKey,
    callback: Arc<dyn Callback>,
    span: tracing::Span,
) -> Result<KeyOutcome> {
    let key = candidate.name().to_string();

    // Move the key to in-progress. Failing here means someone beat us to
    // it (or storage hiccuped); the key stays queued either way.
    let lease = match candidate.start().await {
        Ok(lease) => lease,
        Err(e) if e.is_race_loss() => {
            debug!(key, error = %e, "lost claim race");
            return Ok(KeyOutcome::LostRace);
        }
        Err(e) => {
            warn!(key, error = %e, "failed to start key");
            return Ok(KeyOutcome::StartFailed);
        }
    };
    record_state_transition(&span, "queued", "leased");

    match callback.process(&key).await {
        Ok(()) => {
            lease.complete().await?;
            record_state_transition(&span, "leased", "done");
            Ok(KeyOutcome::Completed)
        }
        Err(e) => {
            warn!(key, error = %e, "callback failed");
            lease.requeue().await?;
            record_state_transition(&span, "leased", "queued");
            Ok(KeyOutcome::Requeued)
        }
    }
}

/// A key store bound to a callback and a concurrency ceiling.
#[derive(Clone)]
pub struct Dispatcher {
    store: KeyStore,
    concurrency: usize,
    callback: Arc<dyn Callback>,
}

impl Dispatcher {
    pub fn new(store: KeyStore, concurrency: usize, callback: Arc<dyn Callback>) -> Self {
        Self {
            store,
            concurrency,
            callback,
        }
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run one iteration.
    pub async fn dispatch(&self) -> Result<DispatchReport> {
        handle(&self.store, self.concurrency, Arc::clone(&self.callback)).await
    }
}
