use super::errors::TrustAnchorError;
use super::source::TrustAnchorWatcher;
use crate::constants::DEFAULT_DEBOUNCE;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for [`TrustAnchorWatcher`].
///
/// # Examples
///
/// ```no_run
/// use dapr_cert_manager_helper::TrustAnchorWatcher;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let watcher = TrustAnchorWatcher::builder()
///     .path("/var/run/trust-anchors/ca.crt")
///     .debounce(Duration::from_millis(250))
///     .build()
///     .await?;
/// println!("loaded {} anchors", watcher.current().len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TrustAnchorWatcherBuilder {
    path: Option<PathBuf>,
    debounce: Duration,
    cancellation_token: Option<CancellationToken>,
    shutdown_timeout: Option<Duration>,
}

impl Default for TrustAnchorWatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustAnchorWatcherBuilder {
    /// Creates a builder with the default debounce window and no path.
    pub fn new() -> Self {
        Self {
            path: None,
            debounce: DEFAULT_DEBOUNCE,
            cancellation_token: None,
            shutdown_timeout: None,
        }
    }

    /// Sets the trust anchor file to load and watch.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets how long the file must be quiet before it is reloaded.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Scopes the watcher to `token`: cancelling it stops the file watch.
    ///
    /// The watcher runs on a child of this token, so shutting the watcher
    /// down never cancels the parent.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Sets the timeout used by [`TrustAnchorWatcher::shutdown_configured`].
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Loads the file and starts watching it.
    ///
    /// # Errors
    ///
    /// Returns [`TrustAnchorError::MissingPath`] if no path was set,
    /// [`TrustAnchorError::Read`] or [`TrustAnchorError::Parse`] if the initial
    /// load fails, and [`TrustAnchorError::Watch`] if the directory cannot be watched.
    pub async fn build(self) -> Result<TrustAnchorWatcher, TrustAnchorError> {
        let path = self.path.ok_or(TrustAnchorError::MissingPath)?;
        let cancel = self
            .cancellation_token
            .map_or_else(CancellationToken::new, |parent| parent.child_token());

        TrustAnchorWatcher::build_with(path, self.debounce, cancel, self.shutdown_timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_without_path_is_rejected() {
        let err = TrustAnchorWatcherBuilder::new().build().await.unwrap_err();
        assert!(matches!(err, TrustAnchorError::MissingPath));
    }

    #[test]
    fn defaults() {
        let builder = TrustAnchorWatcherBuilder::default();
        assert_eq!(builder.debounce, DEFAULT_DEBOUNCE);
        assert!(builder.path.is_none());
        assert!(builder.shutdown_timeout.is_none());
    }
}
