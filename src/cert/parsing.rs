//! Internal parsing helpers for PEM encoded certificates.

use crate::cert::error::CertificateError;
use crate::cert::Certificate;
use pem::{EncodeConfig, LineEnding, Pem};
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::nom::Err;

pub(crate) const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

const PEM_BEGIN_MARKER: &str = "-----BEGIN ";

/// Parses a concatenation of PEM `CERTIFICATE` blocks into a `Vec<Certificate>`.
///
/// Every block must decode to exactly one valid X.509 certificate. Malformed
/// blocks are rejected rather than skipped, and so is non-blank input that
/// holds no PEM block at all.
pub(crate) fn to_certificate_vec_from_pem(
    pem_bytes: &[u8],
) -> Result<Vec<Certificate>, CertificateError> {
    let text = String::from_utf8_lossy(pem_bytes);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let blocks = pem::parse_many(pem_bytes)?;
    if blocks.is_empty() {
        return Err(CertificateError::StrayData);
    }

    // `parse_many` skips sections it cannot frame; a short count means one was
    // malformed.
    let declared = text.matches(PEM_BEGIN_MARKER).count();
    if declared != blocks.len() {
        return Err(CertificateError::Pem(format!(
            "found {declared} PEM headers but only {} well-formed blocks",
            blocks.len()
        )));
    }

    blocks
        .iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_PEM_TAG {
                return Err(CertificateError::UnexpectedPemTag(block.tag().to_string()));
            }
            Certificate::try_from(block.contents())
        })
        .collect()
}

/// Serializes certificates as PEM `CERTIFICATE` blocks with LF line endings.
pub(crate) fn encode_pem<'a>(certs: impl IntoIterator<Item = &'a Certificate>) -> String {
    certs
        .into_iter()
        .map(|cert| {
            let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
            pem::encode_config(&Pem::new(CERTIFICATE_PEM_TAG, cert.as_bytes()), config)
        })
        .collect()
}

/// Parses the given DER-encoded bytes as a single X.509 certificate.
///
/// Returns a [`CertificateError`] if the input is not a parseable DER-encoded X.509
/// certificate or has trailing bytes.
pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, CertificateError> {
    let (rest, cert) = x509_parser::parse_x509_certificate(der_bytes).map_err(map_nom_err)?;
    if !rest.is_empty() {
        return Err(CertificateError::TrailingData(rest.len()));
    }
    Ok(cert)
}

fn map_nom_err(e: Err<X509Error>) -> CertificateError {
    match e {
        Err::Incomplete(_) => CertificateError::ParseX509Certificate(X509Error::InvalidCertificate),
        Err::Error(err) | Err::Failure(err) => CertificateError::ParseX509Certificate(err),
    }
}
