//! Reconciliation of the published Dapr trust bundle.
//!
//! Watch events, trust anchor changes and resync ticks become [`Trigger`]s on
//! an mpsc channel. The [`Scheduler`] coalesces them per [`ReconcileKey`] and
//! drives a [`TrustBundleReconciler`], which reads the CA bundle through a
//! [`BundleStore`], merges in the current trust anchors and writes the result
//! only when its fingerprint changed.

use crate::bundle::{CertificateBundle, Fingerprint};
use crate::error::ErrorClass;
use std::fmt;

pub mod kube_store;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod watch;

pub use kube_store::KubeBundleStore;
pub use reconciler::{ReconcileError, TrustBundleReconciler};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{BundleStore, InMemoryStore, StoreError};

/// Identifies one published trust bundle.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconcileKey {
    /// Namespace of the published bundle.
    pub namespace: String,
    /// Name of the published bundle.
    pub name: String,
}

impl ReconcileKey {
    /// Creates a key for `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Why a key should be reconciled.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Trigger {
    /// The CA secret was created, updated or deleted.
    SecretChanged(ReconcileKey),
    /// The cert-manager `Certificate` changed.
    CertificateChanged(ReconcileKey),
    /// The published bundle was modified or removed by someone else.
    PublishedChanged(ReconcileKey),
    /// The trust anchor file changed.
    AnchorChanged(ReconcileKey),
    /// Periodic resync.
    Resync(ReconcileKey),
}

impl Trigger {
    /// The key this trigger targets.
    pub fn key(&self) -> &ReconcileKey {
        match self {
            Trigger::SecretChanged(key)
            | Trigger::CertificateChanged(key)
            | Trigger::PublishedChanged(key)
            | Trigger::AnchorChanged(key)
            | Trigger::Resync(key) => key,
        }
    }
}

/// Result of a reconcile that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The CA bundle does not exist yet, or the merged bundle would be empty. Nothing was written.
    NotReady,
    /// The published bundle already matches. Nothing was written.
    Unchanged,
    /// A new bundle was written.
    Published {
        /// Fingerprint of the written bundle.
        fingerprint: Fingerprint,
    },
}

/// Steps of one reconcile cycle, logged on each transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// Between cycles.
    Idle,
    /// Reading the CA bundle.
    Fetching,
    /// Merging the CA bundle with the trust anchors.
    Merging,
    /// Comparing against the published bundle.
    Diffing,
    /// Writing the new bundle.
    Publishing,
    /// The cycle failed.
    Error,
}

/// The published trust bundle as stored, or as about to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedBundle {
    /// Merged PEM bundle, stored under `ca.crt`.
    pub pem: String,
    /// Fingerprint annotation. `None` if missing or unparseable.
    pub fingerprint: Option<Fingerprint>,
    /// Version used for optimistic concurrency. `None` for bundles not yet stored.
    pub resource_version: Option<String>,
}

impl PublishedBundle {
    /// Renders `bundle` for publication.
    pub fn from_bundle(bundle: &CertificateBundle) -> Self {
        let pem = bundle.to_pem();
        let fingerprint = Fingerprint::of(&pem);
        Self {
            pem,
            fingerprint: Some(fingerprint),
            resource_version: None,
        }
    }

    /// Returns `true` if this stored bundle has exactly `other`'s content and fingerprint.
    pub fn same_content(&self, other: &PublishedBundle) -> bool {
        self.fingerprint.is_some() && self.fingerprint == other.fingerprint && self.pem == other.pem
    }
}

/// Receives reconcile outcomes. No exporter is bundled; implement this to bridge one.
pub trait MetricsRecorder: Send + Sync {
    /// A new bundle was written.
    fn record_publish(&self) {}
    /// The published bundle was already current.
    fn record_unchanged(&self) {}
    /// The CA bundle was not available yet.
    fn record_not_ready(&self) {}
    /// A reconcile failed.
    fn record_error(&self, _class: ErrorClass) {}
}
