#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{bundle, ca_pem, certificate};
use dapr_cert_manager_helper::controller::{
    InMemoryStore, ReconcileKey, ReconcileOutcome, TrustBundleReconciler,
};
use dapr_cert_manager_helper::{CertificateBundle, ErrorClass, StaticAnchors};
use std::sync::Arc;

fn key() -> ReconcileKey {
    ReconcileKey::new("dapr-system", "dapr-trust-bundle")
}

fn published_bundle(reconciler: &TrustBundleReconciler<InMemoryStore>) -> CertificateBundle {
    let published = reconciler.store().published(&key()).expect("published");
    CertificateBundle::parse_pem(published.pem.as_bytes()).unwrap()
}

#[tokio::test]
async fn reconciling_twice_writes_once() {
    let store = InMemoryStore::new();
    store.set_ca(&key(), ca_pem("ca"));
    let anchors = StaticAnchors::new(bundle(&[&ca_pem("anchor")]));
    let reconciler = TrustBundleReconciler::new(store, Arc::new(anchors));

    let first = reconciler.reconcile(&key()).await.unwrap();
    let second = reconciler.reconcile(&key()).await.unwrap();

    assert!(matches!(first, ReconcileOutcome::Published { .. }));
    assert_eq!(second, ReconcileOutcome::Unchanged);
    assert_eq!(reconciler.store().writes(), 1);
}

#[tokio::test]
async fn published_bundle_round_trips() {
    let ca = ca_pem("ca");
    let store = InMemoryStore::new();
    store.set_ca(&key(), ca.clone());
    let reconciler = TrustBundleReconciler::new(store, Arc::new(StaticAnchors::default()));

    let ReconcileOutcome::Published { fingerprint } = reconciler.reconcile(&key()).await.unwrap()
    else {
        panic!("expected publish");
    };

    let published = reconciler.store().published(&key()).unwrap();
    let reparsed = CertificateBundle::parse_pem(published.pem.as_bytes()).unwrap();
    assert_eq!(reparsed.fingerprint(), fingerprint);
    assert_eq!(reparsed.to_pem(), published.pem);

    assert_eq!(
        reconciler.reconcile(&key()).await.unwrap(),
        ReconcileOutcome::Unchanged
    );
}

#[tokio::test]
async fn anchor_added_to_existing_bundle() {
    let x = ca_pem("x");
    let y = ca_pem("y");

    // CA secret holds {X}, no anchors.
    let store = InMemoryStore::new();
    store.set_ca(&key(), x.clone());
    let reconciler = TrustBundleReconciler::new(store, Arc::new(StaticAnchors::default()));
    reconciler.reconcile(&key()).await.unwrap();
    assert_eq!(published_bundle(&reconciler), bundle(&[&x]));

    // Same CA with anchor {Y}: the published bundle becomes {X, Y}, sorted.
    let store = InMemoryStore::new();
    store.set_ca(&key(), x.clone());
    let previous = reconciler.store().published(&key()).unwrap();
    store.set_published(
        &key(),
        &previous.pem,
        previous.fingerprint.as_ref().map(|f| f.as_str()),
    );
    let reconciler =
        TrustBundleReconciler::new(store, Arc::new(StaticAnchors::new(bundle(&[&y]))));
    let outcome = reconciler.reconcile(&key()).await.unwrap();

    let ReconcileOutcome::Published { fingerprint } = outcome else {
        panic!("expected publish, got {outcome:?}");
    };
    let published = published_bundle(&reconciler);
    assert_eq!(published, bundle(&[&y, &x]));
    assert_eq!(published.fingerprint(), fingerprint);

    let mut expected = vec![certificate(&x), certificate(&y)];
    expected.sort();
    assert_eq!(published.certificates(), expected.as_slice());
}

#[tokio::test]
async fn malformed_ca_mid_run_keeps_previous_bundle() {
    let store = InMemoryStore::new();
    store.set_ca(&key(), ca_pem("ca"));
    let reconciler = TrustBundleReconciler::new(store, Arc::new(StaticAnchors::default()));
    reconciler.reconcile(&key()).await.unwrap();
    let before = reconciler.store().published(&key()).unwrap();

    reconciler.store().set_ca(&key(), "this is not PEM");
    let err = reconciler.reconcile(&key()).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::MalformedInput);
    assert_eq!(reconciler.store().published(&key()).unwrap(), before);
    assert_eq!(reconciler.store().writes(), 1);
}

#[tokio::test]
async fn missing_ca_never_publishes_anchors_alone() {
    let reconciler = TrustBundleReconciler::new(
        InMemoryStore::new(),
        Arc::new(StaticAnchors::new(bundle(&[&ca_pem("anchor")]))),
    );

    assert_eq!(
        reconciler.reconcile(&key()).await.unwrap(),
        ReconcileOutcome::NotReady
    );
    assert!(reconciler.store().published(&key()).is_none());
}

#[tokio::test]
async fn transient_store_failure_is_retryable() {
    let store = InMemoryStore::new();
    store.set_ca(&key(), ca_pem("ca"));
    store.fail_reads(Some("connection refused"));
    let reconciler = TrustBundleReconciler::new(store, Arc::new(StaticAnchors::default()));

    let err = reconciler.reconcile(&key()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransientIo);
    assert!(err.class().is_transient());

    reconciler.store().fail_reads(None);
    assert!(matches!(
        reconciler.reconcile(&key()).await.unwrap(),
        ReconcileOutcome::Published { .. }
    ));
}

#[tokio::test]
async fn deleted_ca_secret_keeps_published_bundle() {
    let store = InMemoryStore::new();
    store.set_ca(&key(), ca_pem("ca"));
    let reconciler = TrustBundleReconciler::new(store, Arc::new(StaticAnchors::default()));
    reconciler.reconcile(&key()).await.unwrap();
    let before = reconciler.store().published(&key()).unwrap();

    reconciler.store().remove_ca(&key());

    assert_eq!(
        reconciler.reconcile(&key()).await.unwrap(),
        ReconcileOutcome::NotReady
    );
    assert_eq!(reconciler.store().published(&key()).unwrap(), before);
    assert_eq!(reconciler.store().writes(), 1);
}
