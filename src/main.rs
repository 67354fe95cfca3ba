use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use k8s_scheduler_extender::cache::ClaimOverlay;
use k8s_scheduler_extender::config::Args;
use k8s_scheduler_extender::extender::ExtenderContext;
use k8s_scheduler_extender::extender::ExtenderServer;
use k8s_scheduler_extender::k8s::client;
use k8s_scheduler_extender::k8s::ClusterCache;
use k8s_scheduler_extender::k8s::ClusterWatcher;
use k8s_scheduler_extender::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();
    tracing::info!(
        port = args.port,
        namespace = args.namespace.as_deref().unwrap_or("<all>"),
        "Starting k8s-scheduler-extender"
    );

    let client = client::connect(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Kubernetes client setup failed: {e:?}"))?;

    let cluster = Arc::new(ClusterCache::new());
    let claims = Arc::new(ClaimOverlay::new(Duration::from_secs(args.claim_ttl_secs)));
    let watcher = Arc::new(ClusterWatcher::new(
        client,
        args.namespace.clone(),
        Arc::clone(&cluster),
        Arc::clone(&claims),
    ));

    let token = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push({
        let watcher = Arc::clone(&watcher);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run_pods(token).await {
                tracing::error!("Pod watcher failed: {e:?}");
            }
        })
    });

    tasks.push({
        let watcher = Arc::clone(&watcher);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run_replica_sets(token).await {
                tracing::error!("Replica-set watcher failed: {e:?}");
            }
        })
    });

    tasks.push({
        let claims = Arc::clone(&claims);
        let token = token.clone();
        tokio::spawn(async move {
            claims.run(token).await;
        })
    });

    // The scheduler must not get answers computed from a half-filled cache.
    tracing::info!("Waiting for initial cache sync");
    cluster.wait_until_synced().await;
    tracing::info!("Cache synced, accepting filter requests");

    let context = Arc::new(ExtenderContext { cluster, claims });
    let server = ExtenderServer::new(context, format!("0.0.0.0:{}", args.port));
    tasks.push({
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("Extender server failed: {e:?}");
            }
        })
    });

    shutdown_requested().await?;
    tracing::info!("Draining watchers and server");
    token.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task failed during shutdown: {e}");
        }
    }

    Ok(())
}

/// Resolves once the process is asked to stop.
async fn shutdown_requested() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;

        let caught = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        tracing::info!(signal = caught, "Stop requested");
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!(signal = "ctrl-c", "Stop requested");
    }

    Ok(())
}
