//! Dispatch span helpers.
//!
//! Provides span creation and state-transition recording for keys flowing
//! through a dispatch iteration.

use tracing::Span;

/// Start a span covering one dispatch iteration.
///
/// `dispatch.launched` is declared empty and filled in once the launch
/// loop has run.
pub fn start_dispatch_span(concurrency: usize) -> Span {
    tracing::info_span!(
        "workqueue.dispatch",
        "dispatch.concurrency" = concurrency,
        "dispatch.launched" = tracing::field::Empty,
    )
}

/// Start a span for one claimed key, from claim to release.
pub fn start_key_span(key: &str) -> Span {
    tracing::info_span!(
        "workqueue.key",
        "key" = key,
        "key.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("key.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
