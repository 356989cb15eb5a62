use super::builder::TrustAnchorWatcherBuilder;
use super::errors::TrustAnchorError;
use super::supervisor::watch_then_load;
use crate::bundle::{AnchorSource, BundleSource, CertificateBundle};
use crate::prelude::{info, warn};
use crate::trust_domain::TrustDomain;
use arc_swap::ArcSwap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle for receiving change notifications from a [`TrustAnchorWatcher`].
///
/// Each published change bumps a monotonically increasing sequence number. The
/// initial load is sequence `0` and is not notified. Slow receivers may skip
/// intermediate values, as with any `watch` channel.
#[derive(Clone, Debug)]
pub struct TrustAnchorUpdates {
    rx: watch::Receiver<u64>,
}

impl TrustAnchorUpdates {
    /// Waits for the next change and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`TrustAnchorError::Closed`] once the watcher has been dropped.
    pub async fn changed(&mut self) -> Result<u64, TrustAnchorError> {
        self.rx
            .changed()
            .await
            .map_err(|_| TrustAnchorError::Closed)?;
        Ok(*self.rx.borrow())
    }

    /// Returns the last sequence number without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the sequence number satisfies `f`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustAnchorError::Closed`] once the watcher has been dropped.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, TrustAnchorError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let seq = self.changed().await?;
            if f(&seq) {
                return Ok(seq);
            }
        }
    }
}

/// Last successfully loaded contents of the trust anchor file.
#[derive(Debug, Clone)]
pub(super) struct AnchorState {
    /// SHA-256 of the raw file bytes.
    pub(super) content_hash: [u8; 32],
    pub(super) bundle: Arc<CertificateBundle>,
}

/// Live source of trust anchors read from a PEM file.
///
/// The file is loaded before [`TrustAnchorWatcherBuilder::build`] returns. A
/// background supervisor then reloads it whenever its directory changes and
/// stays quiet for the debounce window. Reload failures are logged and the
/// last-known-good bundle is kept.
///
/// Use [`TrustAnchorWatcher::shutdown`] or cancel the configured token to stop
/// watching. Dropping the last handle also cancels the supervisor.
#[derive(Clone, Debug)]
pub struct TrustAnchorWatcher {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) path: PathBuf,
    pub(super) debounce: Duration,

    // Atomically replaced, last-known-good anchor state.
    state: ArcSwap<AnchorState>,

    closed: AtomicBool,
    pub(super) cancel: CancellationToken,
    shutdown_timeout: Option<Duration>,

    update_seq: AtomicU64,
    update_tx: watch::Sender<u64>,
    update_rx: watch::Receiver<u64>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchorWatcher")
            .field("path", &self.path)
            .field("debounce", &self.debounce)
            .field("anchors", &self.state.load().bundle.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("cancel", &self.cancel)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("update_seq", &self.update_seq)
            .finish_non_exhaustive()
    }
}

impl TrustAnchorWatcher {
    /// Creates a builder for a [`TrustAnchorWatcher`].
    pub fn builder() -> TrustAnchorWatcherBuilder {
        TrustAnchorWatcherBuilder::new()
    }

    /// Returns the most recently loaded anchor set.
    ///
    /// Lock-free; safe to call while the supervisor is reloading.
    pub fn current(&self) -> Arc<CertificateBundle> {
        Arc::clone(&self.inner.state.load().bundle)
    }

    /// Returns the path of the watched file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns a handle for receiving change notifications.
    pub fn updated(&self) -> TrustAnchorUpdates {
        TrustAnchorUpdates {
            rx: self.inner.update_rx.clone(),
        }
    }

    /// Returns `true` while the watcher is open and its supervisor is running.
    ///
    /// This is a best-effort check for probes.
    pub fn is_healthy(&self) -> bool {
        !(self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled())
    }

    /// Stops the file watch and waits for the supervisor to exit.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            if let Err(_e) = handle.await {
                warn!(
                    "Error joining trust anchor supervisor during shutdown: error={}",
                    _e
                );
            }
        }
    }

    /// Stops the file watch, aborting the supervisor if it does not exit within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustAnchorError::ShutdownTimeout`] if the supervisor had to be aborted.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), TrustAnchorError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let Some(mut handle) = self.inner.supervisor.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_e)) => {
                warn!(
                    "Error joining trust anchor supervisor during shutdown: error={}",
                    _e
                );
                Ok(())
            }
            Err(_) => {
                warn!("Shutdown timeout exceeded; aborting trust anchor supervisor");
                handle.abort();
                let _ = handle.await;
                Err(TrustAnchorError::ShutdownTimeout)
            }
        }
    }

    /// Shuts down using the timeout configured on the builder, or waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`TrustAnchorError::ShutdownTimeout`] if the configured timeout is exceeded.
    pub async fn shutdown_configured(&self) -> Result<(), TrustAnchorError> {
        if let Some(timeout) = self.inner.shutdown_timeout {
            self.shutdown_with_timeout(timeout).await
        } else {
            self.shutdown().await;
            Ok(())
        }
    }
}

impl TrustAnchorWatcher {
    pub(super) async fn build_with(
        path: PathBuf,
        debounce: Duration,
        cancel: CancellationToken,
        shutdown_timeout: Option<Duration>,
    ) -> Result<TrustAnchorWatcher, TrustAnchorError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fs_watcher, initial) = watch_then_load(&path, event_tx).await?;
        info!(
            "Loaded trust anchors: path={}, certificates={}",
            path.display(),
            initial.bundle.len()
        );

        let inner = Arc::new(Inner::new(path, debounce, initial, cancel, shutdown_timeout));

        let task_inner = Arc::clone(&inner);
        let token = task_inner.cancel.clone();
        let handle = tokio::spawn(async move {
            task_inner.run_reload_supervisor(fs_watcher, event_rx, token).await;
        });

        *inner.supervisor.lock().await = Some(handle);

        Ok(Self { inner })
    }

    /// Test-only constructor that skips the initial load and the filesystem watch.
    #[cfg(test)]
    pub(super) fn new_for_test(path: PathBuf, bundle: CertificateBundle) -> TrustAnchorWatcher {
        let initial = AnchorState {
            content_hash: [0; 32],
            bundle: Arc::new(bundle),
        };
        let inner = Inner::new(
            path,
            crate::constants::DEFAULT_DEBOUNCE,
            initial,
            CancellationToken::new(),
            None,
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    fn assert_open(&self) -> Result<(), TrustAnchorError> {
        if self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled() {
            return Err(TrustAnchorError::Closed);
        }
        Ok(())
    }
}

impl Inner {
    fn new(
        path: PathBuf,
        debounce: Duration,
        initial: AnchorState,
        cancel: CancellationToken,
        shutdown_timeout: Option<Duration>,
    ) -> Self {
        let (update_tx, update_rx) = watch::channel(0u64);
        Self {
            path,
            debounce,
            state: ArcSwap::from_pointee(initial),
            closed: AtomicBool::new(false),
            cancel,
            shutdown_timeout,
            update_seq: AtomicU64::new(0),
            update_tx,
            update_rx,
            supervisor: Mutex::new(None),
        }
    }

    pub(super) fn content_hash(&self) -> [u8; 32] {
        self.state.load().content_hash
    }

    /// Stores a freshly loaded state. Returns `true` if consumers were notified.
    ///
    /// Only a change in the canonical serialization is notified; edits that
    /// touch whitespace or certificate order just refresh the stored hash.
    pub(super) fn apply_update(&self, next: AnchorState) -> bool {
        let previous = self.state.load_full();
        let changed = previous.bundle.to_pem() != next.bundle.to_pem();
        self.state.store(Arc::new(next));
        if changed {
            self.notify_update();
        }
        changed
    }

    fn notify_update(&self) {
        let next = self.update_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.update_tx.send(next);
    }
}

impl Drop for TrustAnchorWatcher {
    fn drop(&mut self) {
        // Only the last handle stops the supervisor.
        if Arc::strong_count(&self.inner) <= 2 {
            self.inner.cancel.cancel();
        }
    }
}

impl AnchorSource for TrustAnchorWatcher {
    fn current(&self) -> Arc<CertificateBundle> {
        TrustAnchorWatcher::current(self)
    }
}

impl BundleSource for TrustAnchorWatcher {
    type Item = CertificateBundle;
    type Error = TrustAnchorError;

    /// Returns the current anchor set for any trust domain.
    fn bundle_for_trust_domain(
        &self,
        _trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        self.assert_open()?;
        let bundle = self.current();
        if bundle.is_empty() {
            return Err(TrustAnchorError::AnchorUnavailable);
        }
        Ok(Some(bundle))
    }
}
