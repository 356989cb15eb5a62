//! Certificate bundle types and the sources that provide them.

use crate::cert::error::CertificateError;
use crate::cert::parsing::encode_pem;
use crate::cert::{certificates_from_pem, Certificate};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::{Display, Formatter};

pub mod merge;
pub mod source;

pub use merge::{merge, merge_pem};
pub use source::{AnchorSource, BundleSource, NoAnchors, StaticAnchors};

const FINGERPRINT_PREFIX: &str = "sha256:";

/// An ordered set of distinct X.509 certificates.
///
/// Invariants: every entry is a valid certificate, no two entries are
/// byte-identical, and entries are kept sorted by their raw DER bytes. The PEM
/// serialization is therefore a pure function of the set's contents.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct CertificateBundle {
    certificates: Vec<Certificate>,
}

/// Content hash of a serialized bundle, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(String);

/// An error that can arise building a [`CertificateBundle`] from encoded input.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum BundleError {
    /// An entry in the input is not a valid PEM/X.509 certificate.
    #[error("invalid certificate in bundle")]
    InvalidCertificate(#[from] CertificateError),
}

impl CertificateBundle {
    /// Creates an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a bundle from already validated certificates, collapsing duplicates.
    pub fn from_certificates(certificates: impl IntoIterator<Item = Certificate>) -> Self {
        let set: BTreeSet<Certificate> = certificates.into_iter().collect();
        Self {
            certificates: set.into_iter().collect(),
        }
    }

    /// Parses a bundle from concatenated PEM `CERTIFICATE` blocks.
    ///
    /// Blank input yields an empty bundle.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidCertificate`] if any block is not a valid certificate.
    pub fn parse_pem(pem: &[u8]) -> Result<Self, BundleError> {
        Ok(Self::from_certificates(certificates_from_pem(pem)?))
    }

    /// Returns the certificates in canonical order.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// Returns the number of distinct certificates.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Returns `true` if the bundle holds no certificates.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Returns `true` if a byte-identical certificate is in the bundle.
    pub fn contains(&self, certificate: &Certificate) -> bool {
        self.certificates.binary_search(certificate).is_ok()
    }

    /// Canonical PEM serialization: one LF-terminated block per certificate, in order.
    pub fn to_pem(&self) -> String {
        encode_pem(&self.certificates)
    }

    /// Fingerprint of [`CertificateBundle::to_pem`].
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.to_pem())
    }
}

impl FromIterator<Certificate> for CertificateBundle {
    fn from_iter<T: IntoIterator<Item = Certificate>>(iter: T) -> Self {
        Self::from_certificates(iter)
    }
}

impl<'a> IntoIterator for &'a CertificateBundle {
    type Item = &'a Certificate;
    type IntoIter = std::slice::Iter<'a, Certificate>;

    fn into_iter(self) -> Self::IntoIter {
        self.certificates.iter()
    }
}

impl Fingerprint {
    /// Computes the fingerprint of a serialized bundle.
    pub fn of(serialized: &str) -> Self {
        let digest = Sha256::digest(serialized.as_bytes());
        Self(format!("{FINGERPRINT_PREFIX}{}", hex::encode(digest)))
    }

    /// Parses a fingerprint previously rendered with [`Display`].
    ///
    /// Returns `None` for anything that is not `sha256:` followed by 64 lowercase hex digits.
    pub fn parse(s: &str) -> Option<Self> {
        let digest = s.strip_prefix(FINGERPRINT_PREFIX)?;
        let well_formed = digest.len() == 64
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        well_formed.then(|| Self(s.to_string()))
    }

    /// Returns the rendered fingerprint.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ca(cn: &str) -> Certificate {
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Certificate::try_from(cert.der().as_ref()).unwrap()
    }

    #[test]
    fn test_bundle_collapses_duplicates_and_sorts() {
        let a = ca("a");
        let b = ca("b");
        let bundle = CertificateBundle::from_certificates([b.clone(), a.clone(), b.clone()]);

        assert_eq!(bundle.len(), 2);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(bundle.certificates(), expected.as_slice());
    }

    #[test]
    fn test_bundle_pem_is_order_independent() {
        let a = ca("a");
        let b = ca("b");
        let ab = format!("{}{}", a.to_pem(), b.to_pem());
        let ba = format!("{}{}", b.to_pem(), a.to_pem());

        let first = CertificateBundle::parse_pem(ab.as_bytes()).unwrap();
        let second = CertificateBundle::parse_pem(ba.as_bytes()).unwrap();

        assert_eq!(first.to_pem(), second.to_pem());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_bundle_parse_pem_rejects_invalid_entry() {
        let input = format!("{}not pem at all\n-----BEGIN CERTIFICATE-----\nZm9v\n-----END CERTIFICATE-----\n", ca("a").to_pem());
        let err = CertificateBundle::parse_pem(input.as_bytes()).unwrap_err();

        assert!(matches!(err, BundleError::InvalidCertificate(..)));
    }

    #[test]
    fn test_bundle_contains() {
        let a = ca("a");
        let bundle = CertificateBundle::from_certificates([a.clone()]);

        assert!(bundle.contains(&a));
        assert!(!bundle.contains(&ca("b")));
    }

    #[test]
    fn test_empty_bundle() {
        let bundle = CertificateBundle::parse_pem(b"\n").unwrap();

        assert!(bundle.is_empty());
        assert_eq!(bundle.to_pem(), "");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = Fingerprint::of("hello");

        assert!(fp.as_str().starts_with("sha256:"));
        assert_eq!(fp.as_str().len(), "sha256:".len() + 64);
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        assert_eq!(fp.to_string(), fp.as_str());
    }

    #[test]
    fn test_fingerprint_parse_rejects_malformed() {
        assert_eq!(Fingerprint::parse(""), None);
        assert_eq!(Fingerprint::parse("sha256:abc"), None);
        assert_eq!(Fingerprint::parse(&format!("md5:{}", "0".repeat(64))), None);
        assert_eq!(Fingerprint::parse(&format!("sha256:{}", "G".repeat(64))), None);
    }
}
