//! Owned leases and their heartbeat.
//!
//! A successful claim returns an [`OwnedLease`] that owns a background task
//! refreshing the lease record. The task is spawned on its own, not tied to
//! whatever request or deadline made the claim, so a short-lived caller
//! can't make a healthy lease go stale. It stops when the lease is
//! completed, requeued or dropped.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{KeyStore, lease_path};
use crate::error::{Error, Result};

#[derive(Debug)]
struct LeaseState {
    /// Version of the lease record as of our last successful write.
    version: String,
    /// Set once a refresh finds the record gone or rewritten by someone else.
    lost: bool,
}

/// A lease this process holds. The only handle that can complete a key.
pub struct OwnedLease {
    store: KeyStore,
    key: String,
    state: Arc<Mutex<LeaseState>>,
    stop: Option<oneshot::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl OwnedLease {
    pub(super) fn spawn(store: KeyStore, key: String, version: String) -> Self {
        let state = Arc::new(Mutex::new(LeaseState {
            version,
            lost: false,
        }));
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat_loop(
            store.clone(),
            key.clone(),
            Arc::clone(&state),
            stop_rx,
        ));
        Self {
            store,
            key,
            state,
            stop: Some(stop_tx),
            heartbeat: Some(heartbeat),
        }
    }

    pub fn name(&self) -> &str {
        &self.key
    }

    /// Current version of the lease record.
    pub fn version(&self) -> String {
        lock(&self.state).version.clone()
    }

    /// Whether a heartbeat discovered that someone else took the lease.
    pub fn is_lost(&self) -> bool {
        lock(&self.state).lost
    }

    /// Finish the key: stop the heartbeat and delete the lease record.
    ///
    /// If the record is no longer ours, another process reclaimed a lease we
    /// still believed we held. That breaks mutual exclusion and is reported
    /// as `Error::InvariantViolation`.
    pub async fn complete(mut self) -> Result<()> {
        let (version, lost) = self.stop_heartbeat().await;
        if lost {
            return Err(Error::InvariantViolation(format!(
                "lease on {:?} was taken over before completion",
                self.key
            )));
        }
        match self
            .store
            .backend
            .conditional_delete(&lease_path(&self.key), &version)
            .await
        {
            Ok(()) => {
                self.store.metrics.record_transition("leased", "done");
                Ok(())
            }
            Err(e) if e.is_race_loss() => Err(Error::InvariantViolation(format!(
                "lease on {:?} changed hands before completion: {e}",
                self.key
            ))),
            Err(e) => Err(e),
        }
    }

    /// Give the key back: stop the heartbeat and return it to the backlog.
    pub async fn requeue(mut self) -> Result<()> {
        let (version, lost) = self.stop_heartbeat().await;
        if lost {
            // Whoever reclaimed it already put it back.
            debug!(key = %self.key, "lease already reclaimed, nothing to requeue");
            return Ok(());
        }
        self.store.release_to_backlog(&self.key, &version).await
    }

    /// Stop the heartbeat and wait for it to exit, so no refresh is in
    /// flight while we release the record.
    async fn stop_heartbeat(&mut self) -> (String, bool) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.heartbeat.take() {
            if let Err(e) = handle.await {
                error!(key = %self.key, error = %e, "heartbeat task failed");
            }
        }
        let state = lock(&self.state);
        (state.version.clone(), state.lost)
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        // Abandoning a lease stops the heartbeat and leaves the record to go
        // stale, exactly as if this process had died.
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl std::fmt::Debug for OwnedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLease")
            .field("key", &self.key)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn heartbeat_loop(
    store: KeyStore,
    key: String,
    state: Arc<Mutex<LeaseState>>,
    mut stop: oneshot::Receiver<()>,
) {
    let path = lease_path(&key);
    loop {
        tokio::select! {
            // Fires on an explicit stop and when the sender is dropped.
            _ = &mut stop => return,
            _ = tokio::time::sleep(store.config.heartbeat_interval) => {}
        }

        let current = lock(&state).version.clone();
        let body = match store.lease_body(&key) {
            Ok(body) => body,
            Err(e) => {
                error!(key, error = %e, "failed to encode heartbeat");
                continue;
            }
        };
        match store
            .backend
            .conditional_replace(&path, &current, body)
            .await
        {
            Ok(version) => {
                debug!(key, version, "heartbeat");
                lock(&state).version = version;
            }
            Err(e) if e.is_race_loss() => {
                warn!(key, error = %e, "lease lost, stopping heartbeat");
                lock(&state).lost = true;
                return;
            }
            Err(e) => {
                // Transient; the next tick retries against the same version.
                warn!(key, error = %e, "heartbeat failed");
            }
        }
    }
}
