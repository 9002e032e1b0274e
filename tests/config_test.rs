use std::collections::HashMap;
use std::time::Duration;

use workqueue::config::{Config, Mode, StoreConfig};
use workqueue::error::Error;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

const SERVING: &[(&str, &str)] = &[
    ("PORT", "8080"),
    ("WORKQUEUE_CONCURRENCY", "5"),
    ("WORKQUEUE_MODE", "gcs"),
    ("WORKQUEUE_BUCKET", "wq-bucket"),
    ("WORKQUEUE_TARGET", "https://reconciler-abc.a.run.app"),
];

fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
    let mut vars: Vec<_> = SERVING
        .iter()
        .filter(|(k, _)| !extra.iter().any(|(e, _)| e == k))
        .copied()
        .collect();
    vars.extend_from_slice(extra);
    vars
}

#[test]
fn config_loads_required_fields_and_defaults() {
    let config = Config::from_lookup(lookup(SERVING)).unwrap();

    assert_eq!(config.port, 8080);
    assert_eq!(config.concurrency, 5);
    assert_eq!(config.target().unwrap(), "https://reconciler-abc.a.run.app");
    assert_eq!(config.store.mode, Mode::Gcs);
    assert_eq!(config.store.bucket.as_deref(), Some("wq-bucket"));
    assert_eq!(config.store.lease.ttl, Duration::from_secs(300));
    assert_eq!(config.store.lease.heartbeat_interval, Duration::from_secs(60));
    assert_eq!(config.store.refresh_interval, Duration::from_secs(30));
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());
}

#[test]
fn config_fails_without_required() {
    for missing in ["PORT", "WORKQUEUE_CONCURRENCY", "WORKQUEUE_MODE"] {
        let vars: Vec<_> = SERVING.iter().filter(|(k, _)| *k != missing).copied().collect();
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{missing}: {err}");
    }
}

#[test]
fn gcs_mode_requires_bucket() {
    let vars: Vec<_> = SERVING
        .iter()
        .filter(|(k, _)| *k != "WORKQUEUE_BUCKET")
        .copied()
        .collect();
    assert!(matches!(
        StoreConfig::from_lookup(lookup(&vars)),
        Err(Error::Config(_))
    ));

    let inmem = StoreConfig::from_lookup(lookup(&[("WORKQUEUE_MODE", "inmem")])).unwrap();
    assert_eq!(inmem.mode, Mode::InMem);
}

#[test]
fn bad_values_are_config_errors() {
    for bad in [
        ("WORKQUEUE_MODE", "s3"),
        ("PORT", "eighty"),
        ("WORKQUEUE_CONCURRENCY", "-1"),
        ("WORKQUEUE_TARGET", "not a uri"),
        ("WORKQUEUE_HEARTBEAT_SECS", "300"),
    ] {
        let err = Config::from_lookup(lookup(&with(&[bad]))).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{bad:?}: {err}");
    }
}

#[test]
fn lease_timing_is_configurable() {
    let vars = with(&[
        ("WORKQUEUE_LEASE_TTL_SECS", "30"),
        ("WORKQUEUE_HEARTBEAT_SECS", "5"),
        ("WORKQUEUE_REFRESH_SECS", "10"),
    ]);
    let config = Config::from_lookup(lookup(&vars)).unwrap();

    assert_eq!(config.store.lease.ttl, Duration::from_secs(30));
    assert_eq!(config.store.lease.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(config.store.refresh_interval, Duration::from_secs(10));
}

#[test]
fn inmem_store_opens_without_bucket() {
    let store_config = StoreConfig::from_lookup(lookup(&[("WORKQUEUE_MODE", "inmem")])).unwrap();
    let store = store_config
        .open(std::sync::Arc::new(workqueue::telemetry::metrics::NoopRecorder))
        .unwrap();
    assert_eq!(store.config().ttl, Duration::from_secs(300));
}
