//! Drives reconciles from triggers, retries and periodic resyncs.

use super::reconciler::TrustBundleReconciler;
use super::store::BundleStore;
use super::{ReconcileKey, ReconcileOutcome, Trigger};
use crate::constants::DEFAULT_RESYNC_INTERVAL;
use crate::health::Readiness;
use crate::prelude::{debug, info, warn};
use crate::supervisor_common::{
    next_backoff, BackoffConfig, ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Scheduling parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Interval between resyncs of every known key.
    pub resync_interval: Duration,
    /// Requeue bounds for transient failures.
    pub backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Single-worker reconcile loop.
///
/// Triggers are collected into a set of dirty keys, so any number of triggers
/// received while a reconcile is running collapse into one follow-up run and
/// no key is ever reconciled concurrently with itself. Transient failures are
/// requeued with exponential backoff; malformed input waits for the next
/// trigger or resync.
pub struct Scheduler<S> {
    reconciler: Arc<TrustBundleReconciler<S>>,
    triggers: mpsc::Receiver<Trigger>,
    resync_keys: Vec<ReconcileKey>,
    config: SchedulerConfig,
    readiness: Option<Readiness>,
}

impl<S> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("resync_keys", &self.resync_keys)
            .field("config", &self.config)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct RetryState {
    // Current backoff per key; cleared on any non-transient result.
    backoff: HashMap<ReconcileKey, Duration>,
    // When each requeued key becomes due.
    due: HashMap<ReconcileKey, Instant>,
}

impl RetryState {
    fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<ReconcileKey> {
        let ready: Vec<_> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ready {
            self.due.remove(key);
        }
        ready
    }

    fn schedule(&mut self, key: &ReconcileKey, config: BackoffConfig) -> Duration {
        let delay = match self.backoff.get(key) {
            Some(current) => next_backoff(*current, config.max_backoff),
            None => config.min_backoff,
        };
        self.backoff.insert(key.clone(), delay);
        self.due.insert(key.clone(), Instant::now() + delay);
        delay
    }

    fn clear(&mut self, key: &ReconcileKey) {
        self.backoff.remove(key);
        self.due.remove(key);
    }
}

impl<S: BundleStore> Scheduler<S> {
    /// Creates a scheduler driving `reconciler` from `triggers`.
    pub fn new(
        reconciler: Arc<TrustBundleReconciler<S>>,
        triggers: mpsc::Receiver<Trigger>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            reconciler,
            triggers,
            resync_keys: Vec::new(),
            config: SchedulerConfig {
                backoff: config.backoff.normalize(),
                ..config
            },
            readiness: None,
        }
    }

    /// Adds a key that is reconciled on start and on every resync tick.
    #[must_use]
    pub fn resync_key(mut self, key: ReconcileKey) -> Self {
        self.resync_keys.push(key);
        self
    }

    /// Marks `readiness` after each reconcile that confirms the published bundle.
    #[must_use]
    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Runs until `token` is cancelled or every trigger sender is dropped.
    ///
    /// A reconcile already in progress is allowed to finish.
    pub async fn run(mut self, token: CancellationToken) {
        let mut pending: BTreeSet<ReconcileKey> = BTreeSet::new();
        let mut retries = RetryState::default();
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        // The first tick completes immediately and performs the initial reconcile.
        let mut resync = interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Starting reconcile scheduler: resync_interval_secs={}, keys={}",
            self.config.resync_interval.as_secs(),
            self.resync_keys.len()
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            while let Ok(trigger) = self.triggers.try_recv() {
                enqueue(&mut pending, &trigger);
            }

            if let Some(key) = pending.pop_first() {
                self.process(&key, &mut retries, &mut error_tracker).await;
                continue;
            }

            let next_retry = retries.next_due();
            tokio::select! {
                biased;

                () = token.cancelled() => break,

                trigger = self.triggers.recv() => match trigger {
                    Some(trigger) => enqueue(&mut pending, &trigger),
                    None => {
                        debug!("All trigger senders dropped; stopping scheduler");
                        break;
                    }
                },

                () = async move {
                    if let Some(at) = next_retry {
                        sleep_until(at).await;
                    }
                }, if next_retry.is_some() => {
                    pending.extend(retries.take_due(Instant::now()));
                }

                _ = resync.tick() => {
                    debug!("Resync tick: keys={}", self.resync_keys.len());
                    pending.extend(self.resync_keys.iter().cloned());
                }
            }
        }

        info!("Reconcile scheduler stopped");
    }

    async fn process(
        &self,
        key: &ReconcileKey,
        retries: &mut RetryState,
        error_tracker: &mut ErrorTracker,
    ) {
        match self.reconciler.reconcile(key).await {
            Ok(outcome) => {
                retries.clear(key);
                if error_tracker.consecutive_count() > 0 {
                    info!(
                        "Reconcile recovered after {} consecutive failures: key={}",
                        error_tracker.consecutive_count(),
                        key
                    );
                    error_tracker.reset();
                }
                if matches!(
                    outcome,
                    ReconcileOutcome::Published { .. } | ReconcileOutcome::Unchanged
                ) {
                    if let Some(readiness) = &self.readiness {
                        readiness.mark_reconciled();
                    }
                }
            }
            Err(e) => {
                let class = e.class();
                let retry_in = if class.is_transient() {
                    Some(retries.schedule(key, self.config.backoff))
                } else {
                    retries.clear(key);
                    None
                };

                let should_warn = error_tracker.record_error(ErrorKey::Reconcile);
                let _retry_ms =
                    retry_in.map_or_else(|| "none".to_string(), |d| d.as_millis().to_string());
                let _cause = std::error::Error::source(&e).map(ToString::to_string);
                if should_warn {
                    warn!(
                        "Reconcile failed: key={}, error={}, cause={:?}, class={}, retry_ms={}",
                        key, e, _cause, class, _retry_ms
                    );
                } else {
                    debug!(
                        "Reconcile failed (repeated): key={}, error={}, cause={:?}, class={}, retry_ms={}, consecutive_failures={}",
                        key,
                        e,
                        _cause,
                        class,
                        _retry_ms,
                        error_tracker.consecutive_count()
                    );
                }
            }
        }
    }
}

fn enqueue(pending: &mut BTreeSet<ReconcileKey>, trigger: &Trigger) {
    debug!("Reconcile triggered: trigger={:?}", trigger);
    pending.insert(trigger.key().clone());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bundle::StaticAnchors;
    use crate::controller::InMemoryStore;

    fn ca_pem(cn: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    fn key() -> ReconcileKey {
        ReconcileKey::new("dapr-system", "dapr-trust-bundle")
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            resync_interval: Duration::from_secs(3600),
            backoff: BackoffConfig {
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
        }
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached within timeout");
    }

    #[test]
    fn retry_backoff_grows_and_resets() {
        let mut retries = RetryState::default();
        let backoff = config().backoff;
        let key = key();

        assert_eq!(retries.schedule(&key, backoff), Duration::from_millis(10));
        let second = retries.schedule(&key, backoff);
        assert!(second >= Duration::from_millis(20) && second <= Duration::from_millis(22));
        for _ in 0..5 {
            retries.schedule(&key, backoff);
        }
        assert_eq!(retries.schedule(&key, backoff), Duration::from_millis(50));

        retries.clear(&key);
        assert!(retries.next_due().is_none());
        assert_eq!(retries.schedule(&key, backoff), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn initial_resync_publishes_and_marks_ready() {
        let store = InMemoryStore::new();
        store.set_ca(&key(), ca_pem("ca.example"));
        let reconciler = Arc::new(TrustBundleReconciler::new(
            store,
            Arc::new(StaticAnchors::default()),
        ));
        let readiness = Readiness::new(false);
        let (_tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let scheduler = Scheduler::new(Arc::clone(&reconciler), rx, config())
            .resync_key(key())
            .readiness(readiness.clone());
        let handle = tokio::spawn(scheduler.run(token.clone()));

        wait_until(|| readiness.is_ready()).await;
        assert_eq!(reconciler.store().writes(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn resync_repairs_out_of_band_edit() {
        let store = InMemoryStore::new();
        store.set_ca(&key(), ca_pem("ca.example"));
        let reconciler = Arc::new(TrustBundleReconciler::new(
            store,
            Arc::new(StaticAnchors::default()),
        ));
        let (_tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            Arc::clone(&reconciler),
            rx,
            SchedulerConfig {
                resync_interval: Duration::from_millis(200),
                ..config()
            },
        )
        .resync_key(key());
        let handle = tokio::spawn(scheduler.run(token.clone()));

        let r = Arc::clone(&reconciler);
        wait_until(move || r.store().writes() == 1).await;
        let expected = reconciler.store().published(&key()).unwrap().pem;

        // No trigger is sent for the edit; only a later resync tick can notice it.
        reconciler.store().set_published(&key(), "tampered", None);

        let r = Arc::clone(&reconciler);
        wait_until(move || {
            r.store()
                .published(&key())
                .is_some_and(|published| published.pem == expected)
        })
        .await;
        assert_eq!(reconciler.store().writes(), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bursts_of_triggers_coalesce() {
        let store = InMemoryStore::new();
        store.set_ca(&key(), ca_pem("ca.example"));
        let reconciler = Arc::new(TrustBundleReconciler::new(
            store,
            Arc::new(StaticAnchors::default()),
        ));
        let (tx, rx) = mpsc::channel(64);
        for _ in 0..20 {
            tx.send(Trigger::SecretChanged(key())).await.unwrap();
        }
        drop(tx);

        // No resync keys: only the queued triggers drive reconciles. The loop
        // exits once the channel is drained and closed.
        Scheduler::new(Arc::clone(&reconciler), rx, config())
            .run(CancellationToken::new())
            .await;
        assert_eq!(reconciler.store().writes(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_requeued_until_success() {
        let store = InMemoryStore::new();
        store.set_ca(&key(), ca_pem("ca.example"));
        store.inject_conflicts(3);
        let reconciler = Arc::new(TrustBundleReconciler::new(
            store,
            Arc::new(StaticAnchors::default()),
        ));
        let (tx, rx) = mpsc::channel(8);
        tx.send(Trigger::Resync(key())).await.unwrap();
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(Arc::clone(&reconciler), rx, config());
        let handle = tokio::spawn(scheduler.run(token.clone()));

        let r = Arc::clone(&reconciler);
        wait_until(move || r.store().writes() == 1).await;

        token.cancel();
        handle.await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn malformed_input_is_not_requeued() {
        let store = InMemoryStore::new();
        store.set_ca(&key(), "-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----\n");
        let reconciler = Arc::new(TrustBundleReconciler::new(
            store,
            Arc::new(StaticAnchors::default()),
        ));
        let (tx, rx) = mpsc::channel(8);
        tx.send(Trigger::SecretChanged(key())).await.unwrap();
        let scheduler = Scheduler::new(Arc::clone(&reconciler), rx, config());
        let mut retries = RetryState::default();
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        scheduler.process(&key(), &mut retries, &mut tracker).await;
        assert!(retries.next_due().is_none());
        assert_eq!(tracker.consecutive_count(), 1);
        assert_eq!(reconciler.store().writes(), 0);
        drop(tx);
    }
}
