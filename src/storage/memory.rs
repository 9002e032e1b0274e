//! In-memory storage backend.
//!
//! Provides the same conditional-write contract as the blob store with no
//! network in the way. Versions are monotonically increasing integers, and
//! every mutation happens under one lock so each compare-and-swap is atomic.
//! Latency and failures can be injected to exercise the slow and broken
//! paths of the lease engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{ObjectMeta, StorageBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    updated: DateTime<Utc>,
}

/// Thread-safe in-memory backend. Cloning shares the underlying map.
#[derive(Clone)]
pub struct MemoryBackend {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    next_version: Arc<Mutex<u64>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Backend whose record timestamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            next_version: Arc::new(Mutex::new(0)),
            fail_prefixes: Arc::new(Mutex::new(Vec::new())),
            clock,
            latency: None,
        }
    }

    /// Sleep this long before every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every operation touching a path under `prefix` fail with a
    /// storage error until [`clear_failures`](Self::clear_failures).
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        lock(&self.fail_prefixes).push(prefix.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.fail_prefixes).clear();
    }

    /// Raw body of a record, for assertions.
    pub fn get(&self, path: &str) -> Option<Bytes> {
        lock(&self.objects).get(path).map(|o| o.data.clone())
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.objects).keys().cloned().collect();
        paths.sort();
        paths
    }

    async fn enter(&self, path: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if lock(&self.fail_prefixes)
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return Err(Error::Storage(format!("injected failure for {path}")));
        }
        Ok(())
    }

    fn bump(&self) -> u64 {
        let mut next = lock(&self.next_version);
        *next += 1;
        *next
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("objects", &lock(&self.objects).len())
            .field("latency", &self.latency)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn parse_version(path: &str, version: &str) -> Result<u64> {
    version.parse().map_err(|_| Error::VersionMismatch {
        path: path.to_string(),
        expected: version.to_string(),
    })
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_if_absent(&self, path: &str, data: Bytes) -> Result<String> {
        self.enter(path).await?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(path) {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        let version = self.bump();
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version,
                updated: self.clock.now(),
            },
        );
        Ok(version.to_string())
    }

    async fn conditional_replace(
        &self,
        path: &str,
        expected_version: &str,
        data: Bytes,
    ) -> Result<String> {
        self.enter(path).await?;
        let expected = parse_version(path, expected_version)?;
        let mut objects = lock(&self.objects);
        match objects.get_mut(path) {
            Some(obj) if obj.version == expected => {
                let version = self.bump();
                obj.data = data;
                obj.version = version;
                obj.updated = self.clock.now();
                Ok(version.to_string())
            }
            _ => Err(Error::VersionMismatch {
                path: path.to_string(),
                expected: expected_version.to_string(),
            }),
        }
    }

    async fn conditional_delete(&self, path: &str, expected_version: &str) -> Result<()> {
        self.enter(path).await?;
        let expected = parse_version(path, expected_version)?;
        let mut objects = lock(&self.objects);
        match objects.get(path) {
            None => Err(Error::NotFound(path.to_string())),
            Some(obj) if obj.version != expected => Err(Error::VersionMismatch {
                path: path.to_string(),
                expected: expected_version.to_string(),
            }),
            Some(_) => {
                objects.remove(path);
                Ok(())
            }
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(path).await?;
        Ok(lock(&self.objects).get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            version: obj.version.to_string(),
            updated: obj.updated,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(prefix).await?;
        Ok(lock(&self.objects)
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                version: obj.version.to_string(),
                updated: obj.updated,
            })
            .collect())
    }
}
