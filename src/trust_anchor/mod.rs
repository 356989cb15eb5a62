//! Live, file-backed source of operator supplied trust anchors.
//!
//! [`TrustAnchorWatcher`] loads a PEM file once at startup (failing fast if it
//! cannot), then watches the file's directory and reloads it after a debounce
//! window. Consumers read the last-known-good bundle with
//! [`TrustAnchorWatcher::current`] and observe changes through
//! [`TrustAnchorWatcher::updated`].

mod builder;
mod errors;
mod source;
mod supervisor;

pub use builder::TrustAnchorWatcherBuilder;
pub use errors::TrustAnchorError;
pub use source::{TrustAnchorUpdates, TrustAnchorWatcher};
