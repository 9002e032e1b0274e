//! # workqueue
//!
//! Distributed work queue with at most one active worker per key, kept in
//! object storage through a lease protocol built on conditional writes.
//!
//! Producers [`queue`](keystore::KeyStore::queue) keys. Each trigger runs one
//! [`dispatcher::handle`] iteration, which reclaims orphaned leases, claims
//! as many backlog keys as the concurrency limit allows and drives each one
//! through a [`Callback`](dispatcher::Callback).

pub mod clock;
pub mod conformance;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gcp;
pub mod keystore;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod telemetry;
