use anyhow::Context as _;
use clap::Parser as _;
use dapr_cert_manager_helper::config::{LogFormat, Options};
use dapr_cert_manager_helper::controller::watch::{forward_anchor_updates, run_cluster_watches};
use dapr_cert_manager_helper::controller::{KubeBundleStore, Scheduler, TrustBundleReconciler};
use dapr_cert_manager_helper::health::{serve_probes, Readiness};
use dapr_cert_manager_helper::leader_election::LeaderElector;
use dapr_cert_manager_helper::{AnchorSource, NoAnchors, TrustAnchorWatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

const TRIGGER_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,dapr_cert_manager_helper=debug,kube=info,tower=warn,hyper=warn")
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.context("failed to install tracing subscriber")
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
        () = token.cancelled() => return,
    }
    token.cancel();
}

fn leader_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dapr-cert-manager-helper-{:08x}", fastrand::u32(..)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    init_logging(opts.log_format)?;
    opts.validate()?;

    info!(
        namespace = %opts.dapr_namespace,
        certificate = %opts.trust_bundle_certificate_name,
        bundle = %opts.trust_bundle_name,
        trust_anchor_file = ?opts.trust_anchor_file_path,
        "Starting dapr-cert-manager-helper"
    );

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let readiness = Readiness::new(opts.trust_anchor_file_path.is_some());
    let probes = tokio::spawn(serve_probes(
        opts.readyz_port,
        readiness.clone(),
        token.clone(),
    ));

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    // A configured anchor file that cannot be loaded is fatal.
    let watcher = match &opts.trust_anchor_file_path {
        Some(path) => {
            let watcher = TrustAnchorWatcher::builder()
                .path(path)
                .debounce(opts.trust_anchor_debounce())
                .cancellation_token(token.clone())
                .shutdown_timeout(Some(SHUTDOWN_TIMEOUT))
                .build()
                .await
                .with_context(|| format!("failed to load trust anchors from {}", path.display()))?;
            info!(
                path = %watcher.path().display(),
                anchors = watcher.current().len(),
                "Trust anchors loaded"
            );
            readiness.mark_anchors_loaded();
            Some(watcher)
        }
        None => None,
    };
    let anchors: Arc<dyn AnchorSource> = match &watcher {
        Some(watcher) => Arc::new(watcher.clone()),
        None => Arc::new(NoAnchors),
    };

    let leader = if opts.disable_leader_election {
        None
    } else {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &opts.dapr_namespace,
            &opts.leader_election_id,
            &leader_identity(),
        ));
        if !elector.acquire(&token).await {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        let holder = Arc::clone(&elector);
        let hold_token = token.clone();
        Some(tokio::spawn(async move { holder.hold(hold_token).await }))
    };

    let key = opts.reconcile_key();
    let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);

    tokio::spawn(run_cluster_watches(
        client.clone(),
        key.clone(),
        opts.trust_bundle_certificate_name.clone(),
        tx.clone(),
        token.clone(),
    ));
    if let Some(watcher) = &watcher {
        tokio::spawn(forward_anchor_updates(
            watcher.updated(),
            key.clone(),
            tx.clone(),
            token.clone(),
        ));
    }
    drop(tx);

    let store = KubeBundleStore::new(client, opts.trust_bundle_certificate_name.clone());
    let reconciler = Arc::new(TrustBundleReconciler::new(store, anchors));
    Scheduler::new(reconciler, rx, opts.scheduler_config())
        .resync_key(key)
        .readiness(readiness)
        .run(token.clone())
        .await;

    token.cancel();
    if let Some(watcher) = &watcher {
        if let Err(e) = watcher.shutdown_configured().await {
            warn!(error = %e, "Trust anchor watcher did not stop cleanly");
        }
    }
    if let Some(leader) = leader {
        if let Err(e) = leader.await {
            warn!(error = %e, "Leader election task failed");
        }
    }
    match probes.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Probe server failed"),
        Err(e) => warn!(error = %e, "Probe server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}
