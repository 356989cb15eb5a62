//! Classification of reconcile failures.

use std::fmt;

/// How a failure should be treated by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorClass {
    /// The CA material does not exist yet. Not an error; wait for the next trigger.
    NotReady,
    /// A storage or API failure expected to clear on its own. Requeued with backoff.
    TransientIo,
    /// Input that cannot be parsed. Logged; retried on the next natural trigger.
    MalformedInput,
    /// Misconfiguration that stops startup.
    FatalConfig,
}

impl ErrorClass {
    /// Returns `true` if the key should be requeued with backoff.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::TransientIo)
    }

    /// Stable lowercase label, suitable for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotReady => "not_ready",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::MalformedInput => "malformed_input",
            ErrorClass::FatalConfig => "fatal_config",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
