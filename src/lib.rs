#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Keeps the Dapr trust bundle in sync with a cert-manager `Certificate`.
//!
//! The CA bundle issued into the certificate's secret is merged with an
//! optional, operator-supplied trust anchor file and published as a
//! `ConfigMap` that Dapr sidecars read. The merge is deterministic, so the
//! bundle is rewritten only when the set of trusted certificates changes.
//!
//! ```no_run
//! use dapr_cert_manager_helper::controller::{InMemoryStore, ReconcileKey, TrustBundleReconciler};
//! use dapr_cert_manager_helper::TrustAnchorWatcher;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let anchors = TrustAnchorWatcher::builder()
//!     .path("/var/run/trust-anchors/ca.crt")
//!     .build()
//!     .await?;
//!
//! let store = InMemoryStore::new();
//! let reconciler = TrustBundleReconciler::new(store, Arc::new(anchors));
//! let outcome = reconciler
//!     .reconcile(&ReconcileKey::new("dapr-system", "dapr-trust-bundle"))
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`tracing`** (default): log through `tracing`
//! - **`logging`**: log through `log` when `tracing` is disabled

pub mod bundle;
pub mod cert;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod trust_anchor;
pub mod trust_domain;

mod observability;
mod prelude;
mod supervisor_common;

pub use crate::bundle::{
    merge, merge_pem, AnchorSource, BundleError, BundleSource, CertificateBundle, Fingerprint,
    NoAnchors, StaticAnchors,
};
pub use crate::cert::error::CertificateError;
pub use crate::cert::Certificate;
pub use crate::error::ErrorClass;
pub use crate::supervisor_common::BackoffConfig;
pub use crate::trust_anchor::{
    TrustAnchorError, TrustAnchorUpdates, TrustAnchorWatcher, TrustAnchorWatcherBuilder,
};
pub use crate::trust_domain::{TrustDomain, TrustDomainError};
