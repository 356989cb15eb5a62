use super::errors::TrustAnchorError;
use super::source::{AnchorState, Inner};
use crate::bundle::CertificateBundle;
use crate::prelude::{debug, info, warn};
use crate::supervisor_common::{ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

type FsEvent = notify::Result<Event>;

/// Reads the raw bytes of the trust anchor file.
async fn read_anchor_bytes(path: &Path) -> Result<Vec<u8>, TrustAnchorError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| TrustAnchorError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn content_hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn parse_anchor_bytes(path: &Path, bytes: &[u8]) -> Result<CertificateBundle, TrustAnchorError> {
    CertificateBundle::parse_pem(bytes).map_err(|source| TrustAnchorError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads and parses the trust anchor file.
async fn load_anchor_file(path: &Path) -> Result<AnchorState, TrustAnchorError> {
    let bytes = read_anchor_bytes(path).await?;
    let bundle = parse_anchor_bytes(path, &bytes)?;
    Ok(AnchorState {
        content_hash: content_hash(&bytes),
        bundle: Arc::new(bundle),
    })
}

/// Watches the directory holding `path` and forwards raw events to `tx`.
///
/// The directory is watched rather than the file so that atomic renames and
/// Kubernetes `..data` symlink swaps are observed.
fn watch_directory(
    path: &Path,
    tx: mpsc::UnboundedSender<FsEvent>,
) -> Result<RecommendedWatcher, TrustAnchorError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut watcher = notify::recommended_watcher(move |event: FsEvent| {
        let _ = tx.send(event);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Installs the directory watch, then performs the initial load.
///
/// Events raised from the moment the watch exists are queued on `tx`, so an
/// edit landing while the file is first read still triggers a reload.
pub(super) async fn watch_then_load(
    path: &Path,
    tx: mpsc::UnboundedSender<FsEvent>,
) -> Result<(RecommendedWatcher, AnchorState), TrustAnchorError> {
    let fs_watcher = match watch_directory(path, tx) {
        Ok(fs_watcher) => fs_watcher,
        Err(e) => {
            // A missing or unreadable file is the more useful error to report.
            load_anchor_file(path).await?;
            return Err(e);
        }
    };
    let initial = load_anchor_file(path).await?;
    Ok((fs_watcher, initial))
}

fn is_relevant(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
}

impl Inner {
    /// Reload loop: debounces filesystem events and reloads once the file settles.
    ///
    /// `_fs_watcher` is owned here so the watch is released when the loop exits.
    pub(super) async fn run_reload_supervisor(
        &self,
        _fs_watcher: RecommendedWatcher,
        mut events: mpsc::UnboundedReceiver<FsEvent>,
        cancellation_token: CancellationToken,
    ) {
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => {
                    debug!("Cancellation signal received; stopping trust anchor watch");
                    return;
                }

                event = events.recv() => match event {
                    Some(Ok(event)) => {
                        if is_relevant(&event) {
                            // Each event pushes the reload out by a full window.
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Err(_e)) => {
                        if error_tracker.record_error(ErrorKey::AnchorWatch) {
                            warn!("Trust anchor watch reported an error: error={}", _e);
                        } else {
                            debug!(
                                "Trust anchor watch reported an error (repeated): error={}, consecutive_failures={}",
                                _e,
                                error_tracker.consecutive_count()
                            );
                        }
                    }
                    None => {
                        warn!("Trust anchor watch channel closed; stopping supervisor");
                        return;
                    }
                },

                () = async move {
                    if let Some(at) = deadline {
                        sleep_until(at).await;
                    }
                }, if deadline.is_some() => {
                    deadline = None;
                    self.reload(&mut error_tracker).await;
                }
            }
        }
    }

    /// Re-reads the file, keeping the last-known-good bundle on failure.
    ///
    /// Returns `true` if a change was published to consumers.
    pub(super) async fn reload(&self, error_tracker: &mut ErrorTracker) -> bool {
        let bytes = match read_anchor_bytes(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_reload_error(error_tracker, ErrorKey::AnchorRead, &e);
                return false;
            }
        };

        let hash = content_hash(&bytes);
        if hash == self.content_hash() {
            debug!("Trust anchor file unchanged: path={}", self.path.display());
            return false;
        }

        let bundle = match parse_anchor_bytes(&self.path, &bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.report_reload_error(error_tracker, ErrorKey::AnchorParse, &e);
                return false;
            }
        };

        if error_tracker.consecutive_count() > 0 {
            info!(
                "Trust anchor reload recovered after {} consecutive failures",
                error_tracker.consecutive_count()
            );
        }
        error_tracker.reset();

        let certificates = bundle.len();
        let changed = self.apply_update(AnchorState {
            content_hash: hash,
            bundle: Arc::new(bundle),
        });
        if changed {
            info!(
                "Trust anchors changed: path={}, certificates={}",
                self.path.display(),
                certificates
            );
        } else {
            debug!(
                "Trust anchor file rewritten without changing its certificates: path={}",
                self.path.display()
            );
        }
        changed
    }

    fn report_reload_error(
        &self,
        error_tracker: &mut ErrorTracker,
        key: ErrorKey,
        _error: &TrustAnchorError,
    ) {
        if error_tracker.record_error(key) {
            warn!(
                "Failed to reload trust anchors; keeping last-known-good bundle: error={}, cause={:?}",
                _error,
                std::error::Error::source(_error).map(ToString::to_string)
            );
        } else {
            debug!(
                "Failed to reload trust anchors (repeated): error={}, consecutive_failures={}",
                _error,
                error_tracker.consecutive_count()
            );
        }
    }
}
