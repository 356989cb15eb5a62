//! Liveness and readiness probes.

use crate::prelude::{error, info};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared readiness state.
///
/// Ready once the trust anchors (if any) have loaded and at least one
/// reconcile has confirmed the published bundle is current.
#[derive(Clone, Debug)]
pub struct Readiness {
    inner: Arc<ReadinessInner>,
}

#[derive(Debug)]
struct ReadinessInner {
    anchors_loaded: AtomicBool,
    reconciled: AtomicBool,
}

impl Readiness {
    /// Creates a readiness gate. Pass `anchors_configured = false` when no
    /// trust anchor file is in use.
    pub fn new(anchors_configured: bool) -> Self {
        Self {
            inner: Arc::new(ReadinessInner {
                anchors_loaded: AtomicBool::new(!anchors_configured),
                reconciled: AtomicBool::new(false),
            }),
        }
    }

    /// Records that the initial trust anchor load succeeded.
    pub fn mark_anchors_loaded(&self) {
        self.inner.anchors_loaded.store(true, Ordering::Release);
    }

    /// Records a reconcile that ended published or unchanged.
    pub fn mark_reconciled(&self) {
        self.inner.reconciled.store(true, Ordering::Release);
    }

    /// Returns `true` when both conditions hold.
    pub fn is_ready(&self) -> bool {
        self.inner.anchors_loaded.load(Ordering::Acquire)
            && self.inner.reconciled.load(Ordering::Acquire)
    }
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Router serving `/healthz` and `/readyz`.
pub fn probe_routes(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

/// Serves the probes on `0.0.0.0:port` until `token` is cancelled.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve_probes(
    port: u16,
    readiness: Readiness,
    token: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind probe port: port={}, error={}", port, e);
        e
    })?;
    info!("Serving health probes: addr={}", addr);

    axum::serve(listener, probe_routes(readiness))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}
