//! SPIFFE trust domain names.
//!
//! Consumers of the [`BundleSource`](crate::bundle::BundleSource) capability ask
//! for bundles by trust domain; this is the validated key they pass in.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

const SCHEME_PREFIX: &str = "spiffe://";

const VALID_TRUST_DOMAIN_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";

/// Represents a [SPIFFE Trust domain](https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE-ID.md#21-trust-domain)
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrustDomain {
    name: String,
}

/// An error that can arise parsing a trust domain.
#[derive(Debug, Error, PartialEq, Clone)]
#[non_exhaustive]
pub enum TrustDomainError {
    /// The trust domain name cannot be empty.
    #[error("trust domain is missing")]
    MissingTrustDomain,

    /// A trust domain name can only contain chars in a limited char set.
    #[error(
        "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and \
         underscores"
    )]
    BadTrustDomainChar,
}

impl TrustDomain {
    /// Attempts to parse a `TrustDomain` from a bare name or a SPIFFE ID string.
    ///
    /// # Errors
    ///
    /// If the function cannot parse the input as a trust domain, a [`TrustDomainError`]
    /// variant will be returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use dapr_cert_manager_helper::TrustDomain;
    ///
    /// let trust_domain = TrustDomain::new("cluster.local").unwrap();
    /// assert_eq!("cluster.local", trust_domain.to_string());
    /// assert_eq!("spiffe://cluster.local", trust_domain.id_string());
    ///
    /// let trust_domain = TrustDomain::new("spiffe://public/ns/dapr-system/dapr-sentry").unwrap();
    /// assert_eq!("public", trust_domain.to_string());
    /// ```
    pub fn new(id_or_name: &str) -> Result<Self, TrustDomainError> {
        let name = match id_or_name.strip_prefix(SCHEME_PREFIX) {
            Some(rest) => rest.split('/').next().unwrap_or_default(),
            None => id_or_name,
        };

        if name.is_empty() {
            return Err(TrustDomainError::MissingTrustDomain);
        }
        if !name.chars().all(|c| VALID_TRUST_DOMAIN_CHARS.contains(c)) {
            return Err(TrustDomainError::BadTrustDomainChar);
        }

        Ok(TrustDomain {
            name: name.to_string(),
        })
    }

    /// Returns the SPIFFE ID of the trust domain, e.g. "spiffe://cluster.local".
    pub fn id_string(&self) -> String {
        format!("{}{}", SCHEME_PREFIX, self.name)
    }
}

impl Display for TrustDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for TrustDomain {
    fn as_ref(&self) -> &str {
        self.name.as_str()
    }
}

impl FromStr for TrustDomain {
    type Err = TrustDomainError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        TrustDomain::new(name)
    }
}

impl TryFrom<&str> for TrustDomain {
    type Error = TrustDomainError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}
