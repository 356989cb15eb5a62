//! [`BundleStore`] backed by the Kubernetes API.
//!
//! The CA is read from the secret named by the cert-manager `Certificate`'s
//! `spec.secretName`; the merged bundle is written to a `ConfigMap` with the
//! fingerprint as an annotation.

use super::store::{BundleStore, StoreError};
use super::{PublishedBundle, ReconcileKey};
use crate::bundle::Fingerprint;
use crate::constants::{
    CA_CERT_KEY, CERT_MANAGER_GROUP, CERT_MANAGER_VERSION, FIELD_MANAGER, FINGERPRINT_ANNOTATION,
};
use crate::prelude::debug;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use std::collections::BTreeMap;

/// `ApiResource` for cert-manager `Certificate`s.
pub fn certificate_resource() -> ApiResource {
    ApiResource {
        group: CERT_MANAGER_GROUP.to_string(),
        version: CERT_MANAGER_VERSION.to_string(),
        api_version: format!("{CERT_MANAGER_GROUP}/{CERT_MANAGER_VERSION}"),
        kind: "Certificate".to_string(),
        plural: "certificates".to_string(),
    }
}

/// Reads `spec.secretName` from a `Certificate`.
pub fn certificate_secret_name(certificate: &DynamicObject) -> Option<&str> {
    certificate
        .data
        .get("spec")?
        .get("secretName")?
        .as_str()
        .filter(|name| !name.is_empty())
}

/// Returns the `ca.crt` entry of `secret`, treating a blank entry as absent.
pub fn ca_from_secret(secret: &Secret) -> Option<Vec<u8>> {
    let ca = secret.data.as_ref()?.get(CA_CERT_KEY)?;
    if ca.0.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(ca.0.clone())
}

/// Reads the published bundle out of its `ConfigMap`.
pub fn published_from_config_map(config_map: &ConfigMap) -> PublishedBundle {
    let pem = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(CA_CERT_KEY))
        .cloned()
        .unwrap_or_default();
    let fingerprint = config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(FINGERPRINT_ANNOTATION))
        .and_then(|value| Fingerprint::parse(value));

    PublishedBundle {
        pem,
        fingerprint,
        resource_version: config_map.metadata.resource_version.clone(),
    }
}

fn annotations(bundle: &PublishedBundle) -> BTreeMap<String, String> {
    bundle
        .fingerprint
        .iter()
        .map(|fp| (FINGERPRINT_ANNOTATION.to_string(), fp.to_string()))
        .collect()
}

/// Builds a new `ConfigMap` holding `bundle`.
pub fn config_map_for(key: &ReconcileKey, bundle: &PublishedBundle) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            annotations: Some(annotations(bundle)),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        data: Some([(CA_CERT_KEY.to_string(), bundle.pem.clone())].into()),
        ..Default::default()
    }
}

/// Merge patch that updates `bundle` only if the stored version is still `observed_version`.
///
/// Other keys, labels and annotations on the `ConfigMap` are left alone.
pub fn update_patch(bundle: &PublishedBundle, observed_version: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": observed_version,
            "annotations": annotations(bundle),
        },
        "data": BTreeMap::from([(CA_CERT_KEY, bundle.pem.as_str())]),
    })
}

fn map_write_error(key: &ReconcileKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            name: key.name.clone(),
        },
        e => StoreError::Kube(e),
    }
}

/// Reads the CA through cert-manager objects and publishes a `ConfigMap`.
#[derive(Clone)]
pub struct KubeBundleStore {
    client: Client,
    certificate_name: String,
}

impl std::fmt::Debug for KubeBundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBundleStore")
            .field("certificate_name", &self.certificate_name)
            .finish_non_exhaustive()
    }
}

impl KubeBundleStore {
    /// Creates a store reading the CA of `certificate_name`, in the namespace of each key.
    pub fn new(client: Client, certificate_name: impl Into<String>) -> Self {
        Self {
            client,
            certificate_name: certificate_name.into(),
        }
    }

    fn certificates(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &certificate_resource())
    }
}

impl BundleStore for KubeBundleStore {
    async fn read_ca_bundle(&self, key: &ReconcileKey) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(certificate) = self
            .certificates(&key.namespace)
            .get_opt(&self.certificate_name)
            .await?
        else {
            debug!(
                "Certificate not found: namespace={}, name={}",
                key.namespace, self.certificate_name
            );
            return Ok(None);
        };

        let Some(secret_name) = certificate_secret_name(&certificate) else {
            debug!(
                "Certificate has no spec.secretName: namespace={}, name={}",
                key.namespace, self.certificate_name
            );
            return Ok(None);
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(secret) = secrets.get_opt(secret_name).await? else {
            debug!(
                "CA secret not found: namespace={}, name={}",
                key.namespace, secret_name
            );
            return Ok(None);
        };

        Ok(ca_from_secret(&secret))
    }

    async fn read_published(
        &self,
        key: &ReconcileKey,
    ) -> Result<Option<PublishedBundle>, StoreError> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let config_map = config_maps.get_opt(&key.name).await?;
        Ok(config_map.as_ref().map(published_from_config_map))
    }

    async fn publish(
        &self,
        key: &ReconcileKey,
        bundle: &PublishedBundle,
        observed_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);

        match observed_version {
            None => {
                let params = PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                };
                config_maps
                    .create(&params, &config_map_for(key, bundle))
                    .await
                    .map_err(|e| map_write_error(key, e))?;
            }
            Some(version) => {
                let params = PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                };
                let patch = update_patch(bundle, version);
                config_maps
                    .patch(&key.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| map_write_error(key, e))?;
            }
        }
        Ok(())
    }
}
