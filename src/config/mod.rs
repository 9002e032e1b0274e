//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or malformed vars.
//! The storage token is wrapped in secrecy::SecretString to keep it out of logs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::keystore::{KeyStore, LeaseConfig};
use crate::storage::gcs::GcsOptions;
use crate::storage::{GcsBackend, MemoryBackend, StorageBackend};
use crate::telemetry::{LogFormat, TelemetryConfig};
use crate::telemetry::metrics::MetricsRecorder;

/// Which storage backend holds the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Gcs,
    /// Process-local; state is lost on exit.
    InMem,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gcs" => Ok(Mode::Gcs),
            "inmem" => Ok(Mode::InMem),
            other => Err(Error::Config(format!(
                "unsupported WORKQUEUE_MODE {other:?} (expected \"gcs\" or \"inmem\")"
            ))),
        }
    }
}

/// Where the queue lives and how leases are timed.
#[derive(Debug)]
pub struct StoreConfig {
    pub mode: Mode,
    pub bucket: Option<String>,
    pub gcs_endpoint: Option<String>,
    pub gcs_token: Option<SecretString>,
    pub lease: LeaseConfig,
    /// How often idle replicas re-enumerate to keep gauges fresh.
    pub refresh_interval: Duration,
}

/// Configuration for the serving subcommands.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub concurrency: usize,
    /// Downstream service URI. Only the dispatcher needs it.
    pub target: Option<String>,
    pub store: StoreConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    /// Load configuration through `lookup` instead of the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_var(&lookup, "PORT")?
            .ok_or_else(|| missing("PORT"))?;
        let concurrency = parse_var(&lookup, "WORKQUEUE_CONCURRENCY")?
            .ok_or_else(|| missing("WORKQUEUE_CONCURRENCY"))?;

        let target = lookup("WORKQUEUE_TARGET");
        if let Some(target) = &target {
            validate_target(target)?;
        }

        Ok(Self {
            port,
            concurrency,
            target,
            store: StoreConfig::from_lookup(&lookup)?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_var(&lookup, "LOG_FORMAT")?.unwrap_or_default(),
        })
    }

    /// The dispatcher's target, or a config error when unset.
    pub fn target(&self) -> Result<&str> {
        self.target.as_deref().ok_or_else(|| missing("WORKQUEUE_TARGET"))
    }

    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mode: Mode = lookup("WORKQUEUE_MODE")
            .ok_or_else(|| missing("WORKQUEUE_MODE"))?
            .parse()?;

        let bucket = lookup("WORKQUEUE_BUCKET").filter(|b| !b.is_empty());
        if mode == Mode::Gcs && bucket.is_none() {
            return Err(Error::Config(
                "WORKQUEUE_BUCKET is required when WORKQUEUE_MODE=gcs".into(),
            ));
        }

        let defaults = LeaseConfig::default();
        let lease = LeaseConfig {
            ttl: parse_var(&lookup, "WORKQUEUE_LEASE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
            heartbeat_interval: parse_var(&lookup, "WORKQUEUE_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
        };
        lease.validate()?;

        let refresh_interval = parse_var(&lookup, "WORKQUEUE_REFRESH_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        if refresh_interval.is_zero() {
            return Err(Error::Config("WORKQUEUE_REFRESH_SECS must be non-zero".into()));
        }

        Ok(Self {
            mode,
            bucket,
            gcs_endpoint: lookup("WORKQUEUE_GCS_ENDPOINT"),
            gcs_token: lookup("WORKQUEUE_GCS_TOKEN").map(SecretString::from),
            lease,
            refresh_interval,
        })
    }

    /// Build the storage backend this config names.
    pub fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        match self.mode {
            Mode::InMem => Ok(Arc::new(MemoryBackend::new())),
            Mode::Gcs => {
                let bucket = self
                    .bucket
                    .clone()
                    .ok_or_else(|| missing("WORKQUEUE_BUCKET"))?;
                let backend = GcsBackend::new(
                    bucket,
                    GcsOptions {
                        endpoint: self.gcs_endpoint.clone(),
                        token: self.gcs_token.clone(),
                    },
                )?;
                Ok(Arc::new(backend))
            }
        }
    }

    /// Open a key store over the configured backend.
    pub fn open(&self, metrics: Arc<dyn MetricsRecorder>) -> Result<KeyStore> {
        Ok(KeyStore::new(self.backend()?)
            .lease_config(self.lease)
            .metrics(metrics))
    }
}

/// Telemetry settings for subcommands that don't load a full [`Config`].
pub fn telemetry_from_env(service_name: &str) -> Result<TelemetryConfig> {
    Ok(TelemetryConfig {
        endpoint: env_lookup("OTEL_ENDPOINT"),
        service_name: service_name.to_string(),
        log_level: env_lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        log_format: parse_var(&env_lookup, "LOG_FORMAT")?.unwrap_or_default(),
    })
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {name} {raw:?}: {e}")))
        })
        .transpose()
}

fn validate_target(target: &str) -> Result<()> {
    let url = Url::parse(target)
        .map_err(|e| Error::Config(format!("invalid WORKQUEUE_TARGET {target:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "WORKQUEUE_TARGET must be http:// or https://, got {other}://"
        ))),
    }
}
