//! Error types for certificate parsing and validation.

use x509_parser::error::X509Error;

/// An error that may arise parsing and validating X.509 certificates.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// Bytes were left over after the DER encoding of a single certificate.
    #[error("unexpected {0} trailing bytes after DER certificate")]
    TrailingData(usize),

    /// Error returned by the PEM decoding library.
    #[error("failed decoding PEM block: {0}")]
    Pem(String),

    /// A PEM block carried a tag other than `CERTIFICATE`.
    #[error("unexpected PEM block tag: {0}")]
    UnexpectedPemTag(String),

    /// The input contained text that is not part of any PEM block.
    #[error("input contains data outside of PEM blocks")]
    StrayData,
}

impl From<pem::PemError> for CertificateError {
    fn from(err: pem::PemError) -> Self {
        CertificateError::Pem(err.to_string())
    }
}
