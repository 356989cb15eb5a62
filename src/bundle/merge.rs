//! Merging of the CA bundle with the trust anchors.
//!
//! Merging is pure and deterministic: the output depends only on the set of
//! certificates in the inputs, never on their order or encoding details. The
//! reconciler relies on this to use equality of the serialized output as its
//! only "did anything change" signal.

use crate::bundle::{BundleError, CertificateBundle};

/// Returns the distinct-by-bytes union of `ca` and `anchors`, in canonical order.
pub fn merge(ca: &CertificateBundle, anchors: &CertificateBundle) -> CertificateBundle {
    ca.certificates()
        .iter()
        .chain(anchors.certificates())
        .cloned()
        .collect()
}

/// Parses the PEM-encoded CA bundle and merges it with `anchors`.
///
/// # Errors
///
/// Returns [`BundleError::InvalidCertificate`] if any entry of `ca_pem` is not
/// valid PEM/X.509. The caller decides whether that blocks publication.
pub fn merge_pem(
    ca_pem: &[u8],
    anchors: &CertificateBundle,
) -> Result<CertificateBundle, BundleError> {
    let ca = CertificateBundle::parse_pem(ca_pem)?;
    Ok(merge(&ca, anchors))
}
