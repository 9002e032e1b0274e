//! Integration tests for the lease engine.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use workqueue::clock::ManualClock;
use workqueue::error::Error;
use workqueue::keystore::{KeyStore, LeaseConfig};
use workqueue::storage::{MemoryBackend, StorageBackend};
use workqueue::telemetry::metrics::CapturingRecorder;

fn test_store() -> (KeyStore, MemoryBackend, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let backend = MemoryBackend::with_clock(clock.clone());
    let store = KeyStore::new(Arc::new(backend.clone())).clock(clock.clone());
    (store, backend, clock)
}

fn fast_heartbeat() -> LeaseConfig {
    LeaseConfig {
        ttl: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_is_idempotent() {
    let (store, backend, _) = test_store();

    store.queue("a").await.unwrap();
    store.queue("a").await.unwrap();
    store.queue("a").await.unwrap();

    assert_eq!(backend.paths(), vec!["queued/a"]);
}

#[tokio::test]
async fn queue_rejects_empty_key() {
    let (store, backend, _) = test_store();

    let err = store.queue("").await.unwrap_err();
    assert!(matches!(err, Error::InvalidKey(_)));
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn queue_of_leased_key_is_a_noop() {
    let (store, backend, _) = test_store();
    store.queue("a").await.unwrap();
    let queued = store.enumerate().await.unwrap().queued;
    let lease = queued.into_iter().next().unwrap().start().await.unwrap();

    store.queue("a").await.unwrap();

    assert_eq!(backend.paths(), vec!["in-progress/a"]);
    lease.complete().await.unwrap();
}

#[tokio::test]
async fn enumerate_sorts_by_key() {
    let (store, _, _) = test_store();
    for key in ["c", "a", "b"] {
        store.queue(key).await.unwrap();
    }

    let snapshot = store.enumerate().await.unwrap();
    let names: Vec<&str> = snapshot.queued.iter().map(|q| q.name()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn enumerate_reports_sizes_to_recorder() {
    let recorder = Arc::new(CapturingRecorder::new());
    let (store, _, _) = test_store();
    let store = store.metrics(recorder.clone());

    store.queue("a").await.unwrap();
    store.queue("b").await.unwrap();
    let queued = store.enumerate().await.unwrap().queued;
    let lease = queued.into_iter().next().unwrap().start().await.unwrap();
    store.enumerate().await.unwrap();

    assert_eq!(recorder.snapshot_count(), 2);
    assert_eq!(recorder.last_snapshot(), Some((1, 1)));

    lease.complete().await.unwrap();
    let transitions = recorder.transitions();
    assert!(transitions.contains(&("absent".into(), "queued".into())));
    assert!(transitions.contains(&("queued".into(), "leased".into())));
    assert!(transitions.contains(&("leased".into(), "done".into())));
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_moves_key_to_in_progress() {
    let (store, backend, _) = test_store();
    store.queue("a").await.unwrap();

    let queued = store.enumerate().await.unwrap().queued;
    let lease = queued.into_iter().next().unwrap().start().await.unwrap();
    assert_eq!(lease.name(), "a");
    assert_eq!(backend.paths(), vec!["in-progress/a"]);

    let body: serde_json::Value =
        serde_json::from_slice(&backend.get("in-progress/a").unwrap()).unwrap();
    assert_eq!(body["key"], "a");
    assert_eq!(body["holder"], store.holder());

    lease.complete().await.unwrap();
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn only_one_concurrent_start_wins() {
    let (store, _, _) = test_store();
    store.queue("a").await.unwrap();

    let first = store.enumerate().await.unwrap().queued.pop().unwrap();
    let second = store.enumerate().await.unwrap().queued.pop().unwrap();
    let (r1, r2) = tokio::join!(first.start(), second.start());

    let wins = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1, "exactly one start must succeed");
    let loss = if r1.is_ok() { r2.unwrap_err() } else { r1.unwrap_err() };
    assert!(matches!(loss, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn start_tolerates_backlog_entry_already_gone() {
    let (store, backend, _) = test_store();
    store.queue("a").await.unwrap();
    let candidate = store.enumerate().await.unwrap().queued.pop().unwrap();

    // Someone else cleaned up the backlog entry between list and claim.
    let meta = backend.head("queued/a").await.unwrap().unwrap();
    backend
        .conditional_delete("queued/a", &meta.version)
        .await
        .unwrap();

    let lease = candidate.start().await.unwrap();
    lease.complete().await.unwrap();
}

// ---------------------------------------------------------------------------
// Requeue and orphans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requeue_returns_key_to_backlog() {
    let (store, backend, _) = test_store();
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    lease.requeue().await.unwrap();
    assert_eq!(backend.paths(), vec!["queued/a"]);
}

#[tokio::test]
async fn lease_is_orphaned_only_after_ttl() {
    let (store, _, clock) = test_store();
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    clock.advance(Duration::from_secs(300));
    let observed = store.enumerate().await.unwrap().in_progress;
    assert!(!observed[0].is_orphaned());

    clock.advance(Duration::from_secs(1));
    let observed = store.enumerate().await.unwrap().in_progress;
    assert!(observed[0].is_orphaned());

    drop(lease);
}

#[tokio::test]
async fn complete_after_reclaim_is_an_invariant_violation() {
    let (store, backend, clock) = test_store();
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    // The holder stalls past the TTL and another dispatcher reclaims it.
    clock.advance(Duration::from_secs(301));
    let orphan = store.enumerate().await.unwrap().in_progress.pop().unwrap();
    assert!(orphan.is_orphaned());
    orphan.requeue().await.unwrap();
    assert_eq!(backend.paths(), vec!["queued/a"]);

    let err = lease.complete().await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "got {err}");
}

#[tokio::test]
async fn requeue_after_reclaim_is_not_an_error() {
    let (store, backend, clock) = test_store();
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    clock.advance(Duration::from_secs(301));
    let orphan = store.enumerate().await.unwrap().in_progress.pop().unwrap();
    orphan.requeue().await.unwrap();

    lease.requeue().await.unwrap();
    assert_eq!(backend.paths(), vec!["queued/a"]);
}

#[tokio::test]
async fn requeue_of_refreshed_lease_leaves_no_backlog_entry() {
    let backend = MemoryBackend::new();
    let store = KeyStore::new(Arc::new(backend.clone())).lease_config(fast_heartbeat());
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();
    let observed = store.enumerate().await.unwrap().in_progress.pop().unwrap();

    // The holder heartbeats after the observation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    observed.requeue().await.unwrap();

    assert_eq!(backend.paths(), vec!["in-progress/a"]);
    lease.complete().await.unwrap();
    assert!(backend.paths().is_empty());
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_refreshes_lease_version() {
    let backend = MemoryBackend::new();
    let store = KeyStore::new(Arc::new(backend.clone())).lease_config(fast_heartbeat());
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();
    let initial = lease.version();

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_ne!(lease.version(), initial);
    assert!(!lease.is_lost());
    lease.complete().await.unwrap();
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn heartbeat_detects_takeover() {
    let backend = MemoryBackend::new();
    let store = KeyStore::new(Arc::new(backend.clone())).lease_config(fast_heartbeat());
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    // Another writer replaces the record out from under the holder.
    let meta = backend.head("in-progress/a").await.unwrap().unwrap();
    backend
        .conditional_replace("in-progress/a", &meta.version, Bytes::from_static(b"{}"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(lease.is_lost());

    let err = lease.complete().await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
}

#[tokio::test]
async fn dropped_lease_stops_heartbeating() {
    let backend = MemoryBackend::new();
    let store = KeyStore::new(Arc::new(backend.clone())).lease_config(fast_heartbeat());
    store.queue("a").await.unwrap();
    let lease = store
        .enumerate()
        .await
        .unwrap()
        .queued
        .pop()
        .unwrap()
        .start()
        .await
        .unwrap();

    drop(lease);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let before = backend.head("in-progress/a").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let after = backend.head("in-progress/a").await.unwrap().unwrap();

    assert_eq!(before.version, after.version);
}
