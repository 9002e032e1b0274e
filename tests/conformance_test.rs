//! Conformance suites against the in-memory backend, and against a real
//! bucket when one is configured.

use std::sync::Arc;

use workqueue::conformance::{test_concurrency, test_durability, test_semantics};
use workqueue::keystore::{KeyStore, LeaseConfig};
use workqueue::storage::gcs::GcsOptions;
use workqueue::storage::{GcsBackend, MemoryBackend};

fn memory_store(config: LeaseConfig) -> KeyStore {
    KeyStore::new(Arc::new(MemoryBackend::new())).lease_config(config)
}

#[tokio::test]
async fn memory_semantics() {
    test_semantics(memory_store).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrency() {
    test_concurrency(memory_store).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_durability() {
    test_durability(memory_store).await.unwrap();
}

// ---------------------------------------------------------------------------
// GCS
// ---------------------------------------------------------------------------

fn gcs_store(config: LeaseConfig) -> KeyStore {
    let bucket = std::env::var("WORKQUEUE_GCS_TEST_BUCKET")
        .expect("WORKQUEUE_GCS_TEST_BUCKET must be set");
    let backend = GcsBackend::new(
        bucket,
        GcsOptions {
            endpoint: std::env::var("WORKQUEUE_GCS_ENDPOINT").ok(),
            token: None,
        },
    )
    .unwrap();
    KeyStore::new(Arc::new(backend)).lease_config(config)
}

#[tokio::test]
#[ignore] // Requires an empty bucket in WORKQUEUE_GCS_TEST_BUCKET
async fn gcs_semantics() {
    test_semantics(gcs_store).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires an empty bucket in WORKQUEUE_GCS_TEST_BUCKET
async fn gcs_concurrency() {
    test_concurrency(gcs_store).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore] // Requires an empty bucket in WORKQUEUE_GCS_TEST_BUCKET
async fn gcs_durability() {
    test_durability(gcs_store).await.unwrap();
}
