//! Supervisor utilities shared by the trust anchor watcher and the reconcile scheduler.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Maximum number of consecutive identical errors logged at WARN before downgrading to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Allocation-free key type for error tracking categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    /// The trust anchor file could not be read.
    AnchorRead,
    /// The trust anchor file held invalid PEM/X.509.
    AnchorParse,
    /// The filesystem watch reported an error.
    AnchorWatch,
    /// A Kubernetes watch stream reported an error.
    KubeWatch,
    /// A reconcile of the published bundle failed.
    Reconcile,
}

/// Tracks repeated errors to suppress log noise.
///
/// The first N consecutive occurrences of an error kind are reported as
/// WARN-worthy; later ones should be logged at DEBUG. A different kind, or a
/// call to [`ErrorTracker::reset`], starts counting again.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records an error and returns `true` if it should be logged at WARN.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Returns `true` if the token was cancelled before `dur` elapsed.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Exponential backoff with small jitter.
///
/// Doubles `current`, clamps it to `max`, then adds 0-10% jitter (still clamped).
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = (cur.saturating_mul(2)).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis((base.saturating_add(add)).min(max))
}

/// Requeue backoff bounds for transient reconcile failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl BackoffConfig {
    /// Swaps the bounds if they were given in the wrong order.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn error_tracker_downgrades_after_threshold() {
        let mut tracker = ErrorTracker::new(3);
        assert!(tracker.record_error(ErrorKey::AnchorParse));
        assert!(tracker.record_error(ErrorKey::AnchorParse));
        assert!(tracker.record_error(ErrorKey::AnchorParse));
        assert!(!tracker.record_error(ErrorKey::AnchorParse));
        assert_eq!(tracker.consecutive_count(), 4);

        // A different kind resets the streak.
        assert!(tracker.record_error(ErrorKey::AnchorRead));
        assert_eq!(tracker.consecutive_count(), 1);

        tracker.reset();
        assert_eq!(tracker.consecutive_count(), 0);
    }

    #[test]
    fn next_backoff_doubles_and_clamps() {
        let max = Duration::from_secs(10);
        let next = next_backoff(Duration::from_millis(100), max);
        assert!(next >= Duration::from_millis(200));
        assert!(next <= Duration::from_millis(220));

        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(Duration::ZERO, max), Duration::ZERO);
    }

    #[test]
    fn backoff_config_normalize_swaps_inverted_bounds() {
        let config = BackoffConfig {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
        }
        .normalize();
        assert_eq!(config.min_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_or_cancel_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(60)).await);

        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&token, Duration::from_millis(1)).await);
    }
}
