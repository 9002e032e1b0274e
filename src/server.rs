//! HTTP trigger for the dispatcher and the background gauge refresher.
//!
//! Any request, on any path and with any method, runs one dispatch
//! iteration and answers once it finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{Error, Result};
use crate::keystore::KeyStore;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Router that runs one iteration per request.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new().fallback(trigger).with_state(dispatcher)
}

async fn trigger(
    State(dispatcher): State<Dispatcher>,
) -> std::result::Result<Json<DispatchReport>, ApiError> {
    // Detach from the request: a caller hanging up must not abort claimed
    // keys mid-flight.
    let run = tokio::spawn(async move { dispatcher.dispatch().await });
    match run.await {
        Ok(Ok(report)) => Ok(Json(report)),
        Ok(Err(e)) => {
            error!(error = %e, "dispatch iteration failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "dispatch iteration panicked");
            Err(Error::Other(format!("dispatch iteration panicked: {e}")).into())
        }
    }
}

/// Serve the trigger on `listener` until `shutdown` resolves.
pub async fn serve_trigger(
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, concurrency = dispatcher.concurrency(), "dispatcher listening");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("dispatcher drained");
    Ok(())
}

/// Enumerate `store` every `interval` so queue gauges stay current even
/// when no trigger arrives. Runs until `shutdown` is notified.
pub fn spawn_metrics_refresher(
    store: KeyStore,
    interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("metrics refresher shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.enumerate().await {
                        warn!(error = %e, "failed to enumerate for metrics");
                    }
                }
            }
        }
    })
}
