//! Names and defaults shared by the operator and its collaborators.

use std::time::Duration;

/// Namespace Dapr's control plane is installed into.
pub const DEFAULT_DAPR_NAMESPACE: &str = "dapr-system";

/// Name of the cert-manager `Certificate` whose secret carries the CA.
pub const DEFAULT_CERTIFICATE_NAME: &str = "dapr-trust-bundle";

/// Name of the published `ConfigMap` read by the sidecar injector.
pub const DEFAULT_TRUST_BUNDLE_NAME: &str = "dapr-trust-bundle";

/// Data key holding the merged PEM bundle, in both the CA secret and the published `ConfigMap`.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Annotation on the published `ConfigMap` holding the bundle fingerprint.
pub const FINGERPRINT_ANNOTATION: &str = "dapr.io/trust-bundle-fingerprint";

/// Field manager and leader election identity prefix.
pub const FIELD_MANAGER: &str = "dapr-cert-manager-helper";

/// API group and version of cert-manager `Certificate` resources.
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";
/// API version of cert-manager `Certificate` resources.
pub const CERT_MANAGER_VERSION: &str = "v1";

/// Default debounce window for trust anchor file events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default interval between periodic resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
