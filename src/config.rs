//! Command line and environment configuration.

use crate::constants::{DEFAULT_CERTIFICATE_NAME, DEFAULT_DAPR_NAMESPACE, DEFAULT_TRUST_BUNDLE_NAME};
use crate::controller::{ReconcileKey, SchedulerConfig};
use crate::supervisor_common::BackoffConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Operator for managing a Dapr trust bundle using a cert-manager Certificate resource.
#[derive(Parser, Debug, Clone)]
#[command(name = "dapr-cert-manager-helper", version, about, long_about = None)]
pub struct Options {
    /// Namespace Dapr is installed into; the Certificate and the published bundle live here.
    #[arg(long, env = "DAPR_NAMESPACE", default_value = DEFAULT_DAPR_NAMESPACE)]
    pub dapr_namespace: String,

    /// Name of the cert-manager Certificate whose secret holds the CA.
    #[arg(long, env = "TRUST_BUNDLE_CERTIFICATE_NAME", default_value = DEFAULT_CERTIFICATE_NAME)]
    pub trust_bundle_certificate_name: String,

    /// Name of the ConfigMap the merged bundle is published to.
    #[arg(long, env = "TRUST_BUNDLE_NAME", default_value = DEFAULT_TRUST_BUNDLE_NAME)]
    pub trust_bundle_name: String,

    /// Optional PEM file of extra trust anchors to merge into the bundle.
    #[arg(long, env = "TRUST_ANCHOR_FILE_PATH")]
    pub trust_anchor_file_path: Option<PathBuf>,

    /// Port serving /healthz and /readyz.
    #[arg(long, env = "READYZ_PORT", default_value_t = 6060)]
    pub readyz_port: u16,

    /// Seconds between full resyncs of the published bundle.
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Milliseconds the trust anchor file must be quiet before it is reloaded.
    #[arg(long, env = "TRUST_ANCHOR_DEBOUNCE_MS", default_value_t = 500)]
    pub trust_anchor_debounce_ms: u64,

    /// First retry delay after a transient failure, in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub min_backoff_ms: u64,

    /// Maximum retry delay after repeated transient failures, in milliseconds.
    #[arg(long, default_value_t = 300_000)]
    pub max_backoff_ms: u64,

    /// Run without a leader election lease (single replica deployments).
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    pub disable_leader_election: bool,

    /// Name of the leader election Lease.
    #[arg(long, default_value = "dapr-cert-manager-helper")]
    pub leader_election_id: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required name was empty.
    #[error("--{0} must not be empty")]
    EmptyValue(&'static str),

    /// A duration that must be positive was zero.
    #[error("--{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl Options {
    /// Checks the options for values the operator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending flag.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (flag, value) in [
            ("dapr-namespace", &self.dapr_namespace),
            ("trust-bundle-certificate-name", &self.trust_bundle_certificate_name),
            ("trust-bundle-name", &self.trust_bundle_name),
            ("leader-election-id", &self.leader_election_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyValue(flag));
            }
        }
        if let Some(path) = &self.trust_anchor_file_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyValue("trust-anchor-file-path"));
            }
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("resync-interval-secs"));
        }
        Ok(())
    }

    /// The single published bundle this operator reconciles.
    pub fn reconcile_key(&self) -> ReconcileKey {
        ReconcileKey::new(&self.dapr_namespace, &self.trust_bundle_name)
    }

    /// Debounce window for the trust anchor file.
    pub fn trust_anchor_debounce(&self) -> Duration {
        Duration::from_millis(self.trust_anchor_debounce_ms)
    }

    /// Scheduler settings, with inverted backoff bounds swapped.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            backoff: BackoffConfig {
                min_backoff: Duration::from_millis(self.min_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            }
            .normalize(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("dapr-cert-manager-helper").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let opts = parse(&[]);
        assert_eq!(opts.dapr_namespace, "dapr-system");
        assert_eq!(opts.trust_bundle_certificate_name, "dapr-trust-bundle");
        assert_eq!(opts.trust_bundle_name, "dapr-trust-bundle");
        assert_eq!(opts.trust_anchor_file_path, None);
        assert_eq!(opts.readyz_port, 6060);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert!(!opts.disable_leader_election);
        assert_eq!(opts.validate(), Ok(()));

        let config = opts.scheduler_config();
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(opts.trust_anchor_debounce(), Duration::from_millis(500));
        assert_eq!(
            opts.reconcile_key(),
            ReconcileKey::new("dapr-system", "dapr-trust-bundle")
        );
    }

    #[test]
    fn flags_override_defaults() {
        let opts = parse(&[
            "--dapr-namespace",
            "dapr",
            "--trust-anchor-file-path",
            "/etc/anchors/ca.crt",
            "--min-backoff-ms",
            "5000",
            "--max-backoff-ms",
            "100",
            "--log-format",
            "json",
        ]);
        assert_eq!(opts.dapr_namespace, "dapr");
        assert_eq!(
            opts.trust_anchor_file_path,
            Some(PathBuf::from("/etc/anchors/ca.crt"))
        );
        assert_eq!(opts.log_format, LogFormat::Json);

        let backoff = opts.scheduler_config().backoff;
        assert_eq!(backoff.min_backoff, Duration::from_millis(100));
        assert_eq!(backoff.max_backoff, Duration::from_millis(5000));
    }

    #[test]
    fn validate_rejects_empty_names_and_zero_resync() {
        let mut opts = parse(&["--trust-bundle-name", " "]);
        assert_eq!(
            opts.validate(),
            Err(ConfigError::EmptyValue("trust-bundle-name"))
        );

        opts.trust_bundle_name = "dapr-trust-bundle".to_string();
        opts.resync_interval_secs = 0;
        assert_eq!(
            opts.validate(),
            Err(ConfigError::ZeroDuration("resync-interval-secs"))
        );
    }
}
