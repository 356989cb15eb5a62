//! Event sources that feed the scheduler.
//!
//! Each function here runs until its token is cancelled or the scheduler
//! drops its receiver, and turns observed changes into [`Trigger`]s.

use super::kube_store::certificate_resource;
use super::{ReconcileKey, Trigger};
use crate::prelude::{debug, info, warn};
use crate::supervisor_common::{ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR};
use crate::trust_anchor::TrustAnchorUpdates;
use futures::{Stream, StreamExt as _};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt as _;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Annotation cert-manager puts on the secrets it issues into.
pub const CERTIFICATE_NAME_ANNOTATION: &str = "cert-manager.io/certificate-name";

/// Returns `true` if `secret` was issued for the `Certificate` named `certificate_name`.
pub fn is_certificate_secret(secret: &Secret, certificate_name: &str) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CERTIFICATE_NAME_ANNOTATION))
        .is_some_and(|name| name == certificate_name)
}

async fn forward_watch_events<K, S, F>(
    resource: &'static str,
    stream: S,
    tx: &mpsc::Sender<Trigger>,
    token: &CancellationToken,
    mut to_trigger: F,
) where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(&K) -> Option<Trigger>,
{
    let mut stream = std::pin::pin!(stream);
    let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
    info!("Starting watch: resource={}", resource);

    loop {
        let event = tokio::select! {
            () = token.cancelled() => {
                debug!("Cancellation signal received; stopping watch: resource={}", resource);
                return;
            }
            event = stream.next() => event,
        };

        let trigger = match event {
            Some(Ok(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj))) => {
                error_tracker.reset();
                to_trigger(&obj)
            }
            Some(Ok(Event::Init | Event::InitDone)) => {
                debug!("Watch (re)initialised: resource={}", resource);
                None
            }
            Some(Err(_e)) => {
                if error_tracker.record_error(ErrorKey::KubeWatch) {
                    warn!("Watch error, will retry: resource={}, error={}", resource, _e);
                } else {
                    debug!(
                        "Watch error (repeated), will retry: resource={}, error={}, consecutive_failures={}",
                        resource,
                        _e,
                        error_tracker.consecutive_count()
                    );
                }
                None
            }
            None => {
                warn!("Watch stream ended: resource={}", resource);
                return;
            }
        };

        if let Some(trigger) = trigger {
            if tx.send(trigger).await.is_err() {
                debug!("Scheduler gone; stopping watch: resource={}", resource);
                return;
            }
        }
    }
}

/// Watches the cert-manager `Certificate` named `certificate_name` in the key's namespace.
pub async fn watch_certificate(
    client: Client,
    key: ReconcileKey,
    certificate_name: String,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client, &key.namespace, &certificate_resource());
    let config = watcher::Config::default().fields(&format!("metadata.name={certificate_name}"));
    let stream = watcher::watcher(api, config).default_backoff();

    forward_watch_events("certificate", stream, &tx, &token, |_| {
        Some(Trigger::CertificateChanged(key.clone()))
    })
    .await;
}

/// Watches TLS secrets in the key's namespace, triggering on those issued for `certificate_name`.
///
/// The secret name can change with the certificate's `spec.secretName`, so
/// secrets are matched by cert-manager's annotation instead of by name.
pub async fn watch_ca_secrets(
    client: Client,
    key: ReconcileKey,
    certificate_name: String,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) {
    let api: Api<Secret> = Api::namespaced(client, &key.namespace);
    let config = watcher::Config::default().fields("type=kubernetes.io/tls");
    let stream = watcher::watcher(api, config).default_backoff();

    forward_watch_events("secret", stream, &tx, &token, |secret: &Secret| {
        is_certificate_secret(secret, &certificate_name)
            .then(|| Trigger::SecretChanged(key.clone()))
    })
    .await;
}

/// Watches the published `ConfigMap`, so out-of-band edits are repaired promptly.
pub async fn watch_published(
    client: Client,
    key: ReconcileKey,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &key.namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", key.name));
    let stream = watcher::watcher(api, config).default_backoff();

    forward_watch_events("configmap", stream, &tx, &token, |_| {
        Some(Trigger::PublishedChanged(key.clone()))
    })
    .await;
}

/// Runs every Kubernetes watch for `key` until cancelled.
pub async fn run_cluster_watches(
    client: Client,
    key: ReconcileKey,
    certificate_name: String,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) {
    tokio::join!(
        watch_certificate(
            client.clone(),
            key.clone(),
            certificate_name.clone(),
            tx.clone(),
            token.clone(),
        ),
        watch_ca_secrets(
            client.clone(),
            key.clone(),
            certificate_name,
            tx.clone(),
            token.clone(),
        ),
        watch_published(client, key, tx, token),
    );
}

/// Forwards trust anchor changes as [`Trigger::AnchorChanged`].
pub async fn forward_anchor_updates(
    mut updates: TrustAnchorUpdates,
    key: ReconcileKey,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            () = token.cancelled() => return,
            changed = updates.changed() => changed,
        };

        match changed {
            Ok(_seq) => {
                debug!("Trust anchors changed: seq={}", _seq);
                if tx.send(Trigger::AnchorChanged(key.clone())).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                debug!("Trust anchor watcher closed; stopping forwarder");
                return;
            }
        }
    }
}
