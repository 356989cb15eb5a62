use crate::bundle::BundleError;
use crate::error::ErrorClass;
use std::io;
use std::path::PathBuf;

/// Errors produced by [`TrustAnchorWatcher`](super::TrustAnchorWatcher).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrustAnchorError {
    /// The builder was not given a file path.
    #[error("trust anchor file path is not configured")]
    MissingPath,

    /// The trust anchor file could not be read.
    #[error("failed to read trust anchor file {path}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The trust anchor file does not hold valid PEM certificates.
    #[error("failed to parse trust anchor file {path}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: BundleError,
    },

    /// The filesystem watch could not be established.
    #[error("failed to watch trust anchor file")]
    Watch(#[from] notify::Error),

    /// No trust anchors are configured, or none have loaded.
    #[error("no trust anchors available")]
    AnchorUnavailable,

    /// The watcher has been shut down.
    #[error("trust anchor watcher is closed")]
    Closed,

    /// Graceful shutdown did not finish in time and the supervisor was aborted.
    #[error("trust anchor watcher shutdown timed out")]
    ShutdownTimeout,
}

impl TrustAnchorError {
    /// Classifies the error for the reconcile scheduler.
    pub fn class(&self) -> ErrorClass {
        match self {
            TrustAnchorError::MissingPath
            | TrustAnchorError::Read { .. }
            | TrustAnchorError::Parse { .. }
            | TrustAnchorError::Watch(_) => ErrorClass::FatalConfig,
            TrustAnchorError::AnchorUnavailable => ErrorClass::NotReady,
            TrustAnchorError::Closed | TrustAnchorError::ShutdownTimeout => {
                ErrorClass::TransientIo
            }
        }
    }
}
