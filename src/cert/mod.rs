//! `Certificate` type and helpers.
//!
//! The type wraps DER-encoded bytes and validates them at construction time.

use crate::cert::error::CertificateError;
use crate::cert::parsing::{
    encode_pem, parse_der_encoded_bytes_as_x509_certificate, to_certificate_vec_from_pem,
};

pub mod error;
pub(crate) mod parsing;

/// A single DER-encoded X.509 certificate.
///
/// Invariant: instances are always validated as parseable DER-encoded X.509.
/// Ordering and equality are by raw DER bytes.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Returns the certificate bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encodes the certificate as a single PEM `CERTIFICATE` block.
    pub fn to_pem(&self) -> String {
        encode_pem([self])
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: &[u8]) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(der_bytes)?;
        Ok(Self(Vec::from(der_bytes)))
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: Vec<u8>) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(&der_bytes)?;
        Ok(Self(der_bytes))
    }
}

/// Parses every certificate in a concatenation of PEM `CERTIFICATE` blocks.
///
/// Blank input yields an empty list.
///
/// # Errors
///
/// Returns a [`CertificateError`] if any block is not valid PEM, carries a tag
/// other than `CERTIFICATE`, or does not hold exactly one X.509 certificate.
pub fn certificates_from_pem(pem: &[u8]) -> Result<Vec<Certificate>, CertificateError> {
    to_certificate_vec_from_pem(pem)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn self_signed(cn: &str) -> rcgen::Certificate {
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap()
    }

    #[test]
    fn test_certificate_from_der() {
        let generated = self_signed("root-a");
        let cert = Certificate::try_from(generated.der().as_ref()).unwrap();

        assert_eq!(cert.as_bytes(), generated.der().as_ref());
    }

    #[test]
    fn test_certificate_from_der_with_trailing_bytes() {
        let generated = self_signed("root-a");
        let mut der = generated.der().to_vec();
        der.extend_from_slice(&[0, 1, 2]);

        assert_eq!(
            Certificate::try_from(der).unwrap_err(),
            CertificateError::TrailingData(3)
        );
    }

    #[test]
    fn test_certificate_from_corrupted_der() {
        let result = Certificate::try_from(&b"not a certificate"[..]);
        assert!(matches!(
            result.unwrap_err(),
            CertificateError::ParseX509Certificate(..)
        ));
    }

    #[test]
    fn test_pem_round_trip_is_canonical() {
        let generated = self_signed("root-a");
        let cert = Certificate::try_from(generated.der().as_ref()).unwrap();

        // CRLF and surrounding blank lines decode to the same certificate and
        // re-encode to the same LF-terminated text.
        let crlf = generated.pem().replace('\n', "\r\n");
        let noisy = format!("\n\n{crlf}\n\n");
        let parsed = certificates_from_pem(noisy.as_bytes()).unwrap();

        assert_eq!(parsed, vec![cert.clone()]);
        assert_eq!(parsed[0].to_pem(), cert.to_pem());
        assert!(!cert.to_pem().contains('\r'));
    }

    #[test]
    fn test_certificates_from_pem_blank_input() {
        assert!(certificates_from_pem(b"").unwrap().is_empty());
        assert!(certificates_from_pem(b"  \n\t\n").unwrap().is_empty());
    }

    #[test]
    fn test_certificates_from_pem_rejects_garbage() {
        assert_eq!(
            certificates_from_pem(b"hello world").unwrap_err(),
            CertificateError::StrayData
        );
    }

    #[test]
    fn test_certificates_from_pem_rejects_wrong_tag() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let err = certificates_from_pem(key_pair.serialize_pem().as_bytes()).unwrap_err();

        assert_eq!(
            err,
            CertificateError::UnexpectedPemTag("PRIVATE KEY".to_string())
        );
    }

    #[test]
    fn test_certificates_from_pem_rejects_invalid_body() {
        let bogus = "-----BEGIN CERTIFICATE-----\naGVsbG8gd29ybGQ=\n-----END CERTIFICATE-----\n";
        let err = certificates_from_pem(bogus.as_bytes()).unwrap_err();

        assert!(matches!(err, CertificateError::ParseX509Certificate(..)));
    }

    #[test]
    fn test_certificates_from_pem_rejects_truncated_block() {
        let valid = self_signed("root-a").pem();
        let truncated = format!("{valid}-----BEGIN CERTIFICATE-----\nMIIB\n");
        let err = certificates_from_pem(truncated.as_bytes()).unwrap_err();

        assert!(matches!(err, CertificateError::Pem(..)));
    }
}
