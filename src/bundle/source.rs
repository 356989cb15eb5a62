//! Capabilities for things that hand out certificate bundles.

use crate::bundle::CertificateBundle;
use crate::trust_anchor::TrustAnchorError;
use crate::trust_domain::TrustDomain;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;

/// Represents a source of bundles queryable by [`TrustDomain`].
pub trait BundleSource {
    /// The bundle type provided by the source.
    type Item: Send + Sync + 'static;

    /// The error type returned by the source.
    type Error: Error + Send + Sync + 'static;

    /// Returns the bundle associated with the given [`TrustDomain`].
    ///
    /// If no bundle is associated with the trust domain, returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `Err(Self::Error)` if the bundle cannot be retrieved from the underlying source.
    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error>;
}

/// A source of externally supplied trust anchors.
///
/// The reconciler calls [`AnchorSource::current`] at the start of every cycle
/// and never caches the result across cycles.
pub trait AnchorSource: Send + Sync + 'static {
    /// Returns the current anchor set. An empty bundle means "no anchors".
    fn current(&self) -> Arc<CertificateBundle>;
}

impl<T: AnchorSource + ?Sized> AnchorSource for Arc<T> {
    fn current(&self) -> Arc<CertificateBundle> {
        (**self).current()
    }
}

/// Anchor source used when no trust anchor file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnchors;

impl AnchorSource for NoAnchors {
    fn current(&self) -> Arc<CertificateBundle> {
        Arc::new(CertificateBundle::new())
    }
}

impl BundleSource for NoAnchors {
    type Item = CertificateBundle;
    type Error = TrustAnchorError;

    fn bundle_for_trust_domain(
        &self,
        _trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Err(TrustAnchorError::AnchorUnavailable)
    }
}

/// A fixed, in-memory anchor set.
#[derive(Debug, Clone, Default)]
pub struct StaticAnchors {
    bundle: Arc<CertificateBundle>,
}

impl StaticAnchors {
    /// Creates a source that always returns `bundle`.
    pub fn new(bundle: CertificateBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
        }
    }
}

impl AnchorSource for StaticAnchors {
    fn current(&self) -> Arc<CertificateBundle> {
        Arc::clone(&self.bundle)
    }
}

impl BundleSource for StaticAnchors {
    type Item = CertificateBundle;
    type Error = Infallible;

    fn bundle_for_trust_domain(
        &self,
        _trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Ok(Some(Arc::clone(&self.bundle)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn no_anchors_is_empty_and_unavailable() {
        let td = TrustDomain::new("example.org").unwrap();
        assert!(NoAnchors.current().is_empty());
        assert!(matches!(
            NoAnchors.bundle_for_trust_domain(&td),
            Err(TrustAnchorError::AnchorUnavailable)
        ));
    }

    #[test]
    fn arc_wrapped_source_delegates() {
        let source: Arc<dyn AnchorSource> = Arc::new(StaticAnchors::default());
        assert!(source.current().is_empty());
    }
}
