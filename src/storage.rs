//! Storage backend abstraction.
//!
//! The lease engine never talks to a bucket directly; it goes through this
//! contract of versioned conditional writes. Two implementations ship:
//! - [`gcs::GcsBackend`]: Google Cloud Storage, generations as versions.
//! - [`memory::MemoryBackend`]: an in-process map used by the test suites.
//!
//! Version tokens are opaque strings. Every successful write returns a new
//! one; conditional replace and delete only succeed against the token the
//! caller last observed.

pub mod gcs;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use gcs::GcsBackend;
pub use memory::MemoryBackend;

/// Metadata for one stored record, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object path, including the namespace prefix.
    pub path: String,
    /// Version token for conditional operations.
    pub version: String,
    /// Time of the last successful write to this record.
    pub updated: DateTime<Utc>,
}

/// Versioned key/value substrate with compare-and-swap semantics.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Create a record only if none exists at `path`.
    ///
    /// Returns the new version, or `Error::AlreadyExists`.
    async fn create_if_absent(&self, path: &str, data: Bytes) -> Result<String>;

    /// Overwrite a record only if its stored version equals `expected_version`.
    ///
    /// Returns the new version, or a race loss (`Error::VersionMismatch` or
    /// `Error::NotFound`) when the record moved on or vanished since the
    /// caller observed it.
    async fn conditional_replace(
        &self,
        path: &str,
        expected_version: &str,
        data: Bytes,
    ) -> Result<String>;

    /// Delete a record only under the matching version.
    ///
    /// Returns `Error::NotFound` when nothing is stored at `path` and
    /// `Error::VersionMismatch` when something newer is.
    async fn conditional_delete(&self, path: &str, expected_version: &str) -> Result<()>;

    /// Metadata for a single record, `None` if absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Point-in-time listing of every record under `prefix`.
    ///
    /// Not linearizable with concurrent writers, and in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}
