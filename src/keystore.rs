//! Lease engine. Tracks which keys are waiting and which are being worked.
//!
//! Two namespaces live in the storage backend:
//! - `queued/<key>`: the backlog. Existence is the only state.
//! - `in-progress/<key>`: a lease. Its version changes on every heartbeat,
//!   and its timestamp says when the holder last proved it was alive.
//!
//! Exclusivity comes entirely from conditional writes: claiming a key is a
//! create-if-absent of its lease record, so of any number of racing
//! dispatchers exactly one wins. There is no lock service and no
//! in-process coordination between replicas.
//!
//! The handle types encode what a caller may do. A [`QueuedKey`] can only be
//! started. An [`ObservedLease`] (someone's lease, seen in a listing) can only
//! be inspected or reclaimed. An [`OwnedLease`], returned by a successful
//! start, is the only thing that can complete a key.

pub mod lease;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend};
use crate::telemetry::metrics::{MetricsRecorder, NoopRecorder};

pub use lease::OwnedLease;

pub const QUEUED_PREFIX: &str = "queued/";
pub const IN_PROGRESS_PREFIX: &str = "in-progress/";

/// Timing of the lease protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// A lease whose last heartbeat is older than this is orphaned.
    pub ttl: Duration,
    /// How often the holder refreshes its lease. Must be well under `ttl`.
    pub heartbeat_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".into()));
        }
        if self.heartbeat_interval >= self.ttl {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be shorter than lease ttl {:?}",
                self.heartbeat_interval, self.ttl
            )));
        }
        Ok(())
    }
}

/// Body of a lease record. Informational; orphan detection uses the
/// backend's own record timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeaseBody {
    pub key: String,
    pub holder: String,
    pub heartbeat_at: DateTime<Utc>,
}

/// Body of a backlog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BacklogBody {
    key: String,
    queued_at: DateTime<Utc>,
}

/// Durable queue of keys with at most one active holder per key.
///
/// Cheap to clone; clones share the backend, clock and recorder.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
    config: LeaseConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
    holder: Arc<str>,
}

/// Result of [`KeyStore::enumerate`]: both namespaces, sorted by key.
///
/// The two listings are taken separately, so a key moving between them
/// while they run may show up in both or in neither.
pub struct Snapshot {
    pub in_progress: Vec<ObservedLease>,
    pub queued: Vec<QueuedKey>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            config: LeaseConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopRecorder),
            holder: Arc::from(Uuid::new_v4().to_string()),
        }
    }

    pub fn lease_config(mut self, config: LeaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Identifier written into lease records claimed through this store.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Add `key` to the backlog.
    ///
    /// Idempotent: a key that is already queued or already leased is left
    /// alone and the call succeeds.
    pub async fn queue(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        if self.backend.head(&lease_path(key)).await?.is_some() {
            debug!(key, "key already in progress, not queuing");
            return Ok(());
        }

        if self.put_backlog(key).await?.is_some() {
            self.metrics.record_transition("absent", "queued");
        }
        Ok(())
    }

    /// List the in-progress and backlog namespaces.
    ///
    /// Also reports both sizes to the metrics recorder.
    pub async fn enumerate(&self) -> Result<Snapshot> {
        let (leases, backlog) = tokio::try_join!(
            self.backend.list(IN_PROGRESS_PREFIX),
            self.backend.list(QUEUED_PREFIX),
        )?;

        let mut in_progress: Vec<ObservedLease> = leases
            .into_iter()
            .filter_map(|meta| {
                let key = key_of(&meta, IN_PROGRESS_PREFIX)?;
                Some(ObservedLease {
                    store: self.clone(),
                    key,
                    version: meta.version,
                    updated: meta.updated,
                })
            })
            .collect();
        in_progress.sort_by(|a, b| a.key.cmp(&b.key));

        let mut queued: Vec<QueuedKey> = backlog
            .into_iter()
            .filter_map(|meta| {
                let key = key_of(&meta, QUEUED_PREFIX)?;
                Some(QueuedKey {
                    store: self.clone(),
                    key,
                    version: meta.version,
                })
            })
            .collect();
        queued.sort_by(|a, b| a.key.cmp(&b.key));

        self.metrics.record_snapshot(in_progress.len(), queued.len());
        Ok(Snapshot {
            in_progress,
            queued,
        })
    }

    /// Create the backlog entry for `key`. Returns the new entry's version,
    /// or `None` if it was already there.
    async fn put_backlog(&self, key: &str) -> Result<Option<String>> {
        let body = serde_json::to_vec(&BacklogBody {
            key: key.to_string(),
            queued_at: self.clock.now(),
        })?;
        match self
            .backend
            .create_if_absent(&queued_path(key), Bytes::from(body))
            .await
        {
            Ok(version) => Ok(Some(version)),
            Err(Error::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Return a leased key to the backlog, releasing the lease at `version`.
    ///
    /// The backlog entry is written before the lease is deleted, so a crash
    /// between the two steps leaves a duplicate rather than a lost key.
    /// A missing lease means it was already reclaimed or completed
    /// elsewhere, which is not an error. A lease rewritten under a newer
    /// version is still live, so the entry created here is rolled back.
    async fn release_to_backlog(&self, key: &str, version: &str) -> Result<()> {
        let created = self.put_backlog(key).await?;
        match self
            .backend
            .conditional_delete(&lease_path(key), version)
            .await
        {
            Ok(()) => {
                self.metrics.record_transition("leased", "queued");
                Ok(())
            }
            Err(Error::VersionMismatch { .. }) => {
                debug!(key, version, "lease refreshed by its holder, not requeuing");
                match created {
                    Some(entry) => self.drop_backlog(key, &entry).await,
                    None => Ok(()),
                }
            }
            Err(e) if e.is_race_loss() => {
                debug!(key, error = %e, "lease already released elsewhere");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the backlog entry for `key` if it is still at `version`.
    async fn drop_backlog(&self, key: &str, version: &str) -> Result<()> {
        match self
            .backend
            .conditional_delete(&queued_path(key), version)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_race_loss() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn lease_body(&self, key: &str) -> Result<Bytes> {
        let body = serde_json::to_vec(&LeaseBody {
            key: key.to_string(),
            holder: self.holder.to_string(),
            heartbeat_at: self.clock.now(),
        })?;
        Ok(Bytes::from(body))
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("config", &self.config)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

/// A key sitting in the backlog, as seen by one enumeration.
pub struct QueuedKey {
    store: KeyStore,
    key: String,
    version: String,
}

impl QueuedKey {
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Claim the key.
    ///
    /// Fails with `Error::AlreadyExists` if another process holds it; that
    /// is a lost race, not a fault. On success the backlog entry is removed
    /// (best effort) and a heartbeat starts keeping the lease fresh.
    pub async fn start(self) -> Result<OwnedLease> {
        let store = self.store;
        let body = store.lease_body(&self.key)?;
        let version = store
            .backend
            .create_if_absent(&lease_path(&self.key), body)
            .await?;
        store.metrics.record_transition("queued", "leased");

        // The entry may already be gone, or re-queued under a newer version
        // while we worked; either way we hold the lease now.
        match store
            .backend
            .conditional_delete(&queued_path(&self.key), &self.version)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_race_loss() => {
                debug!(key = %self.key, error = %e, "backlog entry already moved");
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to remove backlog entry after claim");
            }
        }

        Ok(OwnedLease::spawn(store, self.key, version))
    }
}

impl std::fmt::Debug for QueuedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedKey")
            .field("key", &self.key)
            .field("version", &self.version)
            .finish()
    }
}

/// Somebody's lease, as seen by one enumeration.
pub struct ObservedLease {
    store: KeyStore,
    key: String,
    version: String,
    updated: DateTime<Utc>,
}

impl ObservedLease {
    pub fn name(&self) -> &str {
        &self.key
    }

    /// When the holder last refreshed the lease.
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Whether the last heartbeat is older than the lease TTL.
    ///
    /// Computed locally; observing an orphan writes nothing.
    pub fn is_orphaned(&self) -> bool {
        is_stale(self.updated, self.store.clock.now(), self.store.config.ttl)
    }

    /// Reclaim the lease and put the key back in the backlog.
    pub async fn requeue(self) -> Result<()> {
        self.store
            .release_to_backlog(&self.key, &self.version)
            .await
    }
}

impl std::fmt::Debug for ObservedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedLease")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("updated", &self.updated)
            .finish()
    }
}

fn is_stale(updated: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(updated) > ttl
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['\n', '\r']) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn key_of(meta: &ObjectMeta, prefix: &str) -> Option<String> {
    meta.path
        .strip_prefix(prefix)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

pub(crate) fn queued_path(key: &str) -> String {
    format!("{QUEUED_PREFIX}{key}")
}

pub(crate) fn lease_path(key: &str) -> String {
    format!("{IN_PROGRESS_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn staleness_is_strictly_older_than_ttl() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ttl = Duration::from_secs(300);
        assert!(!is_stale(t0, t0, ttl));
        assert!(!is_stale(t0, t0 + chrono::Duration::seconds(300), ttl));
        assert!(is_stale(t0, t0 + chrono::Duration::seconds(301), ttl));
    }

    #[test]
    fn lease_config_rejects_slow_heartbeat() {
        let config = LeaseConfig {
            ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(LeaseConfig::default().validate().is_ok());
    }

    #[test]
    fn keys_map_to_namespaced_paths() {
        assert_eq!(queued_path("a/b"), "queued/a/b");
        assert_eq!(lease_path("a/b"), "in-progress/a/b");

        let meta = ObjectMeta {
            path: "in-progress/a/b".into(),
            version: "1".into(),
            updated: Utc::now(),
        };
        assert_eq!(key_of(&meta, IN_PROGRESS_PREFIX).as_deref(), Some("a/b"));
        assert_eq!(key_of(&meta, QUEUED_PREFIX), None);
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(matches!(validate_key(""), Err(Error::InvalidKey(_))));
        assert!(validate_key("repo/owner").is_ok());
    }
}
