//! One reconcile cycle: fetch the CA, merge the trust anchors, diff against
//! the published bundle, and write only when it changed.

use super::store::{BundleStore, StoreError};
use super::{MetricsRecorder, PublishedBundle, ReconcileKey, ReconcileOutcome, ReconcilePhase};
use crate::bundle::{merge_pem, AnchorSource, BundleError};
use crate::error::ErrorClass;
use crate::prelude::{debug, info};
use std::fmt::Debug;
use std::sync::Arc;

/// Errors from a reconcile cycle.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Reading or writing through the store failed.
    #[error("bundle store operation failed")]
    Store(#[from] StoreError),

    /// The CA bundle is not valid PEM/X.509. The published bundle was left untouched.
    #[error("CA bundle is malformed")]
    MalformedInput(#[source] BundleError),
}

impl ReconcileError {
    /// Classifies the error for the scheduler.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) => e.class(),
            ReconcileError::MalformedInput(_) => ErrorClass::MalformedInput,
        }
    }
}

/// Computes the merged trust bundle and publishes it when it changed.
///
/// The trust anchors are re-read at the start of every cycle, so a reconcile
/// racing an anchor reload sees either the old or the new set, never a mix.
pub struct TrustBundleReconciler<S> {
    store: S,
    anchors: Arc<dyn AnchorSource>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl<S: Debug> Debug for TrustBundleReconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBundleReconciler")
            .field("store", &self.store)
            .field("anchors", &"<AnchorSource>")
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl<S: BundleStore> TrustBundleReconciler<S> {
    /// Creates a reconciler reading and writing through `store`.
    pub fn new(store: S, anchors: Arc<dyn AnchorSource>) -> Self {
        Self {
            store,
            anchors,
            metrics: None,
        }
    }

    /// Reports outcomes to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one reconcile cycle for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] for transient store failures,
    /// including write conflicts, and [`ReconcileError::MalformedInput`] if the
    /// CA bundle cannot be parsed. Nothing is written in either case.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.run(key).await;

        match &result {
            Ok(outcome) => {
                self.record_outcome(outcome);
                phase(key, ReconcilePhase::Idle);
            }
            Err(e) => {
                phase(key, ReconcilePhase::Error);
                if let Some(metrics) = self.metrics.as_deref() {
                    metrics.record_error(e.class());
                }
            }
        }

        result
    }

    async fn run(&self, key: &ReconcileKey) -> Result<ReconcileOutcome, ReconcileError> {
        phase(key, ReconcilePhase::Fetching);
        let Some(ca_pem) = self.store.read_ca_bundle(key).await? else {
            debug!("CA bundle not available yet: key={}", key);
            return Ok(ReconcileOutcome::NotReady);
        };

        phase(key, ReconcilePhase::Merging);
        let anchors = self.anchors.current();
        let merged = merge_pem(&ca_pem, &anchors).map_err(ReconcileError::MalformedInput)?;
        if merged.is_empty() {
            debug!("Merged trust bundle is empty; not publishing: key={}", key);
            return Ok(ReconcileOutcome::NotReady);
        }

        phase(key, ReconcilePhase::Diffing);
        let desired = PublishedBundle::from_bundle(&merged);
        let current = self.store.read_published(key).await?;
        if let Some(current) = &current {
            if current.same_content(&desired) {
                debug!("Trust bundle up to date: key={}", key);
                return Ok(ReconcileOutcome::Unchanged);
            }
        }

        phase(key, ReconcilePhase::Publishing);
        let observed_version = current.as_ref().and_then(|c| c.resource_version.as_deref());
        self.store.publish(key, &desired, observed_version).await?;

        let fingerprint = merged.fingerprint();
        info!(
            "Published trust bundle: key={}, certificates={}, anchors={}, fingerprint={}",
            key,
            merged.len(),
            anchors.len(),
            fingerprint
        );
        Ok(ReconcileOutcome::Published { fingerprint })
    }

    fn record_outcome(&self, outcome: &ReconcileOutcome) {
        let Some(metrics) = self.metrics.as_deref() else {
            return;
        };
        match outcome {
            ReconcileOutcome::NotReady => metrics.record_not_ready(),
            ReconcileOutcome::Unchanged => metrics.record_unchanged(),
            ReconcileOutcome::Published { .. } => metrics.record_publish(),
        }
    }
}

fn phase(_key: &ReconcileKey, _phase: ReconcilePhase) {
    debug!("Reconcile phase: key={}, phase={:?}", _key, _phase);
}
