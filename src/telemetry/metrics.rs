//! Metric instruments for the work queue.
//!
//! The lease engine reports through an injected [`MetricsRecorder`] rather
//! than touching process-wide state, so it can be exercised in isolation.
//! [`OtelRecorder`] is the production recorder: it holds instruments from
//! the globally-registered OTel `MeterProvider` and is created once at
//! startup.

use std::sync::Mutex;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Meter};

/// Receives queue observations from the key store.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Sizes observed by one enumeration.
    fn record_snapshot(&self, in_progress: usize, queued: usize);

    /// A key moved between lifecycle states ("queued", "leased", "done").
    fn record_transition(&self, from: &str, to: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_snapshot(&self, _in_progress: usize, _queued: usize) {}

    fn record_transition(&self, _from: &str, _to: &str) {}
}

/// Returns the shared meter for workqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workqueue")
}

/// Gauge: keys currently leased by some worker.
/// Labels: `service_name`, `revision_name`.
pub fn in_progress_keys() -> Gauge<u64> {
    meter()
        .u64_gauge("workqueue.in_progress_keys")
        .with_description("The number of keys currently being processed by this workqueue")
        .build()
}

/// Gauge: keys waiting in the backlog.
/// Labels: `service_name`, `revision_name`.
pub fn queued_keys() -> Gauge<u64> {
    meter()
        .u64_gauge("workqueue.queued_keys")
        .with_description("The number of keys currently in the backlog of this workqueue")
        .build()
}

/// Counter: key state transitions.
/// Labels: `from`, `to`.
pub fn key_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.key.transitions")
        .with_description("Number of key state transitions")
        .build()
}

/// Records to OpenTelemetry instruments labeled with the serving revision.
pub struct OtelRecorder {
    in_progress: Gauge<u64>,
    queued: Gauge<u64>,
    transitions: Counter<u64>,
    labels: Vec<KeyValue>,
}

impl OtelRecorder {
    pub fn new(service_name: impl Into<String>, revision_name: impl Into<String>) -> Self {
        Self {
            in_progress: in_progress_keys(),
            queued: queued_keys(),
            transitions: key_transitions(),
            labels: vec![
                KeyValue::new("service_name", service_name.into()),
                KeyValue::new("revision_name", revision_name.into()),
            ],
        }
    }

    /// Labels from the Cloud Run container contract (`K_SERVICE`,
    /// `K_REVISION`), defaulting to "unknown".
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_else(|_| "unknown".to_string());
        Self::new(var("K_SERVICE"), var("K_REVISION"))
    }
}

impl MetricsRecorder for OtelRecorder {
    fn record_snapshot(&self, in_progress: usize, queued: usize) {
        self.in_progress.record(in_progress as u64, &self.labels);
        self.queued.record(queued as u64, &self.labels);
    }

    fn record_transition(&self, from: &str, to: &str) {
        self.transitions.add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

/// Keeps every observation in memory, for assertions.
#[derive(Debug, Default)]
pub struct CapturingRecorder {
    snapshots: Mutex<Vec<(usize, usize)>>,
    transitions: Mutex<Vec<(String, String)>>,
}

impl CapturingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent `(in_progress, queued)` pair.
    pub fn last_snapshot(&self) -> Option<(usize, usize)> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn transitions(&self) -> Vec<(String, String)> {
        self.transitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl MetricsRecorder for CapturingRecorder {
    fn record_snapshot(&self, in_progress: usize, queued: usize) {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((in_progress, queued));
    }

    fn record_transition(&self, from: &str, to: &str) {
        self.transitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((from.to_string(), to.to_string()));
    }
}
