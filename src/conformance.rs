//! Behavioral suites any storage backend must pass.
//!
//! Each suite takes a constructor producing a fresh, empty [`KeyStore`] for
//! a given [`LeaseConfig`], so the same checks run against the in-memory
//! backend in unit tests and against a real bucket when one is available.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::dispatcher::{Callback, handle};
use crate::error::Error;
use crate::keystore::{KeyStore, LeaseConfig, Snapshot};

fn names<'a>(it: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    it.into_iter().map(str::to_string).collect()
}

fn in_progress_names(snapshot: &Snapshot) -> Vec<String> {
    names(snapshot.in_progress.iter().map(|l| l.name()))
}

fn queued_names(snapshot: &Snapshot) -> Vec<String> {
    names(snapshot.queued.iter().map(|q| q.name()))
}

/// Walk one key through every transition of the lease state machine.
pub async fn test_semantics<F>(ctor: F) -> anyhow::Result<()>
where
    F: Fn(LeaseConfig) -> KeyStore,
{
    let store = ctor(LeaseConfig::default());

    let snap = store.enumerate().await?;
    ensure!(
        snap.in_progress.is_empty() && snap.queued.is_empty(),
        "new queue is not empty"
    );

    // Queuing is idempotent.
    store.queue("foo").await?;
    store.queue("foo").await?;
    let snap = store.enumerate().await?;
    ensure!(queued_names(&snap) == ["foo"], "queued = {:?}", queued_names(&snap));
    ensure!(snap.in_progress.is_empty(), "nothing should be in progress");

    // Two observers of the same backlog entry race; exactly one wins.
    let mut first = store.enumerate().await?.queued;
    let mut second = store.enumerate().await?.queued;
    let (Some(winner), Some(loser)) = (first.pop(), second.pop()) else {
        bail!("expected one queued key in each snapshot");
    };
    let lease = winner.start().await.context("first start")?;
    match loser.start().await {
        Err(Error::AlreadyExists(_)) => {}
        Err(e) => bail!("losing start failed with {e}, expected AlreadyExists"),
        Ok(_) => bail!("two starts on the same key both succeeded"),
    }

    let snap = store.enumerate().await?;
    ensure!(
        in_progress_names(&snap) == ["foo"],
        "in progress = {:?}",
        in_progress_names(&snap)
    );
    ensure!(snap.queued.is_empty(), "claimed key is still queued");
    ensure!(
        !snap.in_progress[0].is_orphaned(),
        "fresh lease reported orphaned"
    );

    // Queuing a leased key does not create a second entry.
    store.queue("foo").await?;
    let snap = store.enumerate().await?;
    ensure!(snap.queued.is_empty(), "leased key was queued again");

    // Requeue puts it back.
    lease.requeue().await?;
    let snap = store.enumerate().await?;
    ensure!(snap.in_progress.is_empty(), "requeued key still in progress");
    ensure!(queued_names(&snap) == ["foo"], "queued = {:?}", queued_names(&snap));

    // Claim again and complete.
    let Some(next) = snap.queued.into_iter().next() else {
        bail!("requeued key missing from backlog");
    };
    let lease = next.start().await?;
    lease.complete().await?;
    let snap = store.enumerate().await?;
    ensure!(
        snap.in_progress.is_empty() && snap.queued.is_empty(),
        "completed key left state behind"
    );

    Ok(())
}

/// Queue 1000 keys from a 40-key alphabet while overlapping dispatch
/// iterations run every 100ms with a slow callback. Checks that the queue
/// drains, that no key is lost, and that no more than `concurrency`
/// callbacks ever run at once.
pub async fn test_concurrency<F>(ctor: F) -> anyhow::Result<()>
where
    F: Fn(LeaseConfig) -> KeyStore,
{
    const CONCURRENCY: usize = 5;

    let store = ctor(LeaseConfig::default());

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let processed: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

    let callback: Arc<dyn Callback> = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let processed = Arc::clone(&processed);
        Arc::new(move |key: String| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let processed = Arc::clone(&processed);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Much longer than the dispatch tick, so iterations overlap.
                tokio::time::sleep(Duration::from_secs(1)).await;
                *processed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(key)
                    .or_default() += 1;
                running.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    };

    let stop = Arc::new(tokio::sync::Notify::new());
    let ticker = {
        let store = store.clone();
        let callback = Arc::clone(&callback);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut iterations = JoinSet::new();
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tick.tick() => {
                        let store = store.clone();
                        let callback = Arc::clone(&callback);
                        iterations.spawn(async move {
                            handle(&store, CONCURRENCY, callback).await
                        });
                    }
                }
            }
            let mut first_error = None;
            while let Some(joined) = iterations.join_next().await {
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        first_error.get_or_insert_with(|| anyhow::Error::from(e));
                    }
                    Err(e) => {
                        first_error.get_or_insert_with(|| anyhow::Error::from(e));
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    };

    let mut queued = BTreeSet::new();
    for _ in 0..1000 {
        let key = rand::thread_rng().gen_range(0..40).to_string();
        store.queue(&key).await.context("queue")?;
        queued.insert(key);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(120);
    loop {
        let snap = store.enumerate().await?;
        if snap.in_progress.is_empty() && snap.queued.is_empty() {
            break;
        }
        ensure!(
            Instant::now() < deadline,
            "queue did not drain (in progress: {}, queued: {})",
            snap.in_progress.len(),
            snap.queued.len()
        );
        info!(
            in_progress = snap.in_progress.len(),
            queued = snap.queued.len(),
            "waiting for work to complete"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    stop.notify_one();
    ticker.await.context("dispatch ticker panicked")??;

    let peak = peak.load(Ordering::SeqCst);
    ensure!(
        peak <= CONCURRENCY,
        "{peak} callbacks ran at once, limit is {CONCURRENCY}"
    );
    let processed = processed.lock().unwrap_or_else(|e| e.into_inner());
    let missing: Vec<&String> = queued.iter().filter(|k| !processed.contains_key(*k)).collect();
    ensure!(missing.is_empty(), "keys never processed: {missing:?}");

    Ok(())
}

/// A worker dies holding "b". Later iterations must notice the lease went
/// stale, put "b" back and finish all three keys.
pub async fn test_durability<F>(ctor: F) -> anyhow::Result<()>
where
    F: Fn(LeaseConfig) -> KeyStore,
{
    let lease_config = LeaseConfig {
        ttl: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(500),
    };
    let store = ctor(lease_config);

    for key in ["a", "b", "c"] {
        store.queue(key).await?;
    }

    // Claim "b" and abandon it, as if the process crashed mid-callback.
    let snap = store.enumerate().await?;
    let Some(b) = snap.queued.into_iter().find(|q| q.name() == "b") else {
        bail!("\"b\" missing from backlog");
    };
    drop(b.start().await?);

    let processed: Arc<Mutex<Vec<String>>> = Arc::default();
    let callback: Arc<dyn Callback> = {
        let processed = Arc::clone(&processed);
        Arc::new(move |key: String| {
            let processed = Arc::clone(&processed);
            async move {
                processed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(key);
                anyhow::Ok(())
            }
        })
    };

    // While the dead lease is fresh, only "a" and "c" run.
    let report = handle(&store, 3, Arc::clone(&callback)).await?;
    ensure!(report.active == 1, "abandoned lease not counted active: {report:?}");
    ensure!(report.completed == 2, "expected a and c to complete: {report:?}");

    let deadline = Instant::now() + lease_config.ttl * 10;
    let mut reclaimed = false;
    loop {
        let report = handle(&store, 3, Arc::clone(&callback)).await?;
        reclaimed |= report.orphans_requeued > 0;

        let snap = store.enumerate().await?;
        if snap.in_progress.is_empty() && snap.queued.is_empty() {
            break;
        }
        ensure!(Instant::now() < deadline, "abandoned key was never reclaimed");
        tokio::time::sleep(lease_config.heartbeat_interval).await;
    }
    ensure!(reclaimed, "no iteration reported reclaiming the orphan");

    let mut processed = processed.lock().unwrap_or_else(|e| e.into_inner()).clone();
    processed.sort();
    ensure!(processed == ["a", "b", "c"], "processed = {processed:?}");

    Ok(())
}
