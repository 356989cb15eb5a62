//! Storage seam between the reconciler and the cluster.

use super::{PublishedBundle, ReconcileKey};
use crate::error::ErrorClass;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Errors returned by a [`BundleStore`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The published bundle changed since it was read.
    #[error("published bundle {name} was modified concurrently")]
    Conflict {
        /// Name of the published bundle.
        name: String,
    },

    /// A Kubernetes API call failed.
    #[error("kubernetes api request failed")]
    Kube(#[from] kube::Error),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Every store failure is expected to clear on retry.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientIo
    }
}

/// Where the CA bundle is read from and the merged bundle is written to.
pub trait BundleStore: Send + Sync + 'static {
    /// Reads the PEM CA bundle for `key`.
    ///
    /// Returns `Ok(None)` while the certificate, its secret or the CA entry does not exist yet.
    fn read_ca_bundle(
        &self,
        key: &ReconcileKey,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Reads the currently published bundle, if any.
    fn read_published(
        &self,
        key: &ReconcileKey,
    ) -> impl Future<Output = Result<Option<PublishedBundle>, StoreError>> + Send;

    /// Writes `bundle`, creating it when `observed_version` is `None`.
    ///
    /// Fails with [`StoreError::Conflict`] if the stored version no longer matches.
    fn publish(
        &self,
        key: &ReconcileKey,
        bundle: &PublishedBundle,
        observed_version: Option<&str>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Default)]
struct InMemoryState {
    ca: HashMap<ReconcileKey, Vec<u8>>,
    published: HashMap<ReconcileKey, PublishedBundle>,
    next_version: u64,
    fail_reads: Option<String>,
    conflicts_to_inject: usize,
}

/// A [`BundleStore`] kept in process memory.
///
/// Versions are assigned like Kubernetes resource versions, so concurrent
/// modification can be simulated with [`InMemoryStore::set_published`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CA bundle for `key`.
    pub fn set_ca(&self, key: &ReconcileKey, pem: impl Into<Vec<u8>>) {
        self.lock().ca.insert(key.clone(), pem.into());
    }

    /// Removes the CA bundle for `key`.
    pub fn remove_ca(&self, key: &ReconcileKey) {
        self.lock().ca.remove(key);
    }

    /// Overwrites the published bundle out of band, bumping its version.
    pub fn set_published(&self, key: &ReconcileKey, pem: &str, fingerprint: Option<&str>) {
        let mut state = self.lock();
        state.next_version += 1;
        let bundle = PublishedBundle {
            pem: pem.to_string(),
            fingerprint: fingerprint.and_then(crate::bundle::Fingerprint::parse),
            resource_version: Some(state.next_version.to_string()),
        };
        state.published.insert(key.clone(), bundle);
    }

    /// Returns the published bundle for `key`.
    pub fn published(&self, key: &ReconcileKey) -> Option<PublishedBundle> {
        self.lock().published.get(key).cloned()
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every read fail with [`StoreError::Unavailable`] until cleared with `None`.
    pub fn fail_reads(&self, reason: Option<&str>) {
        self.lock().fail_reads = reason.map(ToString::to_string);
    }

    /// Makes the next `count` publishes fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().conflicts_to_inject = count;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_reads(state: &InMemoryState) -> Result<(), StoreError> {
        match &state.fail_reads {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl BundleStore for InMemoryStore {
    async fn read_ca_bundle(&self, key: &ReconcileKey) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.lock();
        Self::check_reads(&state)?;
        Ok(state.ca.get(key).cloned())
    }

    async fn read_published(
        &self,
        key: &ReconcileKey,
    ) -> Result<Option<PublishedBundle>, StoreError> {
        let state = self.lock();
        Self::check_reads(&state)?;
        Ok(state.published.get(key).cloned())
    }

    async fn publish(
        &self,
        key: &ReconcileKey,
        bundle: &PublishedBundle,
        observed_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let conflict = || StoreError::Conflict {
            name: key.name.clone(),
        };

        if state.conflicts_to_inject > 0 {
            state.conflicts_to_inject -= 1;
            return Err(conflict());
        }

        let stored_version = state
            .published
            .get(key)
            .and_then(|p| p.resource_version.clone());
        if stored_version.as_deref() != observed_version {
            return Err(conflict());
        }

        state.next_version += 1;
        let mut stored = bundle.clone();
        stored.resource_version = Some(state.next_version.to_string());
        state.published.insert(key.clone(), stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key() -> ReconcileKey {
        ReconcileKey::new("dapr-system", "dapr-trust-bundle")
    }

    fn bundle(pem: &str) -> PublishedBundle {
        PublishedBundle {
            pem: pem.to_string(),
            fingerprint: None,
            resource_version: None,
        }
    }

    #[tokio::test]
    async fn publish_enforces_observed_version() {
        let store = InMemoryStore::new();
        let key = key();

        store.publish(&key, &bundle("a"), None).await.unwrap();
        let v1 = store.published(&key).unwrap().resource_version.unwrap();

        // Create over an existing object conflicts.
        assert!(matches!(
            store.publish(&key, &bundle("b"), None).await,
            Err(StoreError::Conflict { .. })
        ));

        store.publish(&key, &bundle("b"), Some(&v1)).await.unwrap();
        assert!(matches!(
            store.publish(&key, &bundle("c"), Some(&v1)).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.writes(), 2);
        assert_eq!(store.published(&key).unwrap().pem, "b");
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = InMemoryStore::new();
        let key = key();

        store.fail_reads(Some("apiserver down"));
        let err = store.read_ca_bundle(&key).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientIo);
        store.fail_reads(None);
        assert!(store.read_ca_bundle(&key).await.unwrap().is_none());

        store.inject_conflicts(1);
        assert!(store.publish(&key, &bundle("a"), None).await.is_err());
        store.publish(&key, &bundle("a"), None).await.unwrap();
    }
}
