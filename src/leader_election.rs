//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Only the leader runs the scheduler. Updates use the Lease's
//! resourceVersion as a compare-and-swap guard: a 409 means someone else got
//! there first. Losing the lease cancels the process token; cancelling the
//! token releases the lease so a standby can take over immediately.

use crate::prelude::{debug, info, warn};
use crate::supervisor_common::sleep_or_cancel;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lease timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LeaseTiming {
    /// How long a lease stays valid without renewal.
    pub(crate) lease_duration: Duration,
    /// How often the leader renews.
    pub(crate) renew_interval: Duration,
    /// How often a standby retries acquisition.
    pub(crate) retry_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Leader election errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LeaderElectionError {
    /// Kubernetes API error.
    #[error("kubernetes API error")]
    Kube(#[from] kube::Error),

    /// The stored Lease had no resourceVersion to guard an update with.
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the Lease as read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LeaseAction {
    /// No Lease exists yet.
    Create,
    /// We hold it; bump the renew time.
    Renew,
    /// It expired; take it over.
    TakeOver {
        /// Transition count to store.
        transitions: i32,
    },
    /// Someone else holds a live lease.
    Wait,
}

/// Decides how to act on `lease` as `identity` at time `now`.
pub(crate) fn lease_action(
    lease: Option<&Lease>,
    identity: &str,
    now: DateTime<Utc>,
) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };

    if expired {
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseAction::TakeOver {
            transitions: transitions.saturating_add(1),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Holds or waits for the operator's Lease.
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    timing: LeaseTiming,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease_name", &self.lease_name)
            .field("identity", &self.identity)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Creates an elector for Lease `namespace/lease_name`, competing as `identity`.
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing: LeaseTiming::default(),
        }
    }

    /// Waits until this replica holds the Lease.
    ///
    /// Returns `false` if `token` was cancelled first. API errors are logged and retried.
    pub async fn acquire(&self, token: &CancellationToken) -> bool {
        info!(
            "Waiting for leadership: lease={}, identity={}",
            self.lease_name, self.identity
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Leadership acquired: identity={}", self.identity);
                    return true;
                }
                Ok(false) => {
                    debug!("Lease held by another replica; waiting");
                }
                Err(_e) => {
                    warn!("Failed to acquire lease, retrying: error={}", _e);
                }
            }
            if sleep_or_cancel(token, self.timing.retry_interval).await {
                return false;
            }
        }
    }

    /// Renews the Lease until it is lost or `token` is cancelled.
    ///
    /// On loss the token is cancelled so the rest of the process stops. On
    /// cancellation the Lease is released.
    pub async fn hold(&self, token: CancellationToken) {
        loop {
            if sleep_or_cancel(&token, self.timing.renew_interval).await {
                if let Err(_e) = self.release().await {
                    warn!("Failed to release lease: error={}", _e);
                }
                return;
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Leadership lost: identity={}", self.identity);
                    token.cancel();
                    return;
                }
                Err(_e) => {
                    warn!("Failed to renew lease; giving up leadership: error={}", _e);
                    token.cancel();
                    return;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.lease_name).await?;

        match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Create => {
                let lease = self.lease(None, now, now, 0);
                self.write(self.api.create(&PostParams::default(), &lease).await)
            }
            LeaseAction::Renew => {
                let mut lease = existing.unwrap_or_default();
                self.resource_version(&lease)?;
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.write(
                    self.api
                        .replace(&self.lease_name, &PostParams::default(), &lease)
                        .await,
                )
            }
            LeaseAction::TakeOver { transitions } => {
                let version = existing
                    .as_ref()
                    .map(|l| self.resource_version(l))
                    .transpose()?;
                let lease = self.lease(version, now, now, transitions);
                let result = self
                    .api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await;
                if result.is_ok() {
                    info!(
                        "Took over expired lease: identity={}, transitions={}",
                        self.identity, transitions
                    );
                }
                self.write(result)
            }
        }
    }

    /// Clears the holder so another replica can acquire without waiting for expiry.
    async fn release(&self) -> Result<(), LeaderElectionError> {
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        if lease_action(Some(&lease), &self.identity, Utc::now()) != LeaseAction::Renew {
            debug!("Not the lease holder; nothing to release");
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        info!("Lease released: identity={}", self.identity);
        Ok(())
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(
                    i32::try_from(self.timing.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))
    }

    fn write(&self, result: Result<Lease, kube::Error>) -> Result<bool, LeaderElectionError> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Lease write conflict: identity={}", self.identity);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
