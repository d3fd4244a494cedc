//! Arrakis Cluster - gateway shard orchestrator
//!
//! Runs one worker process per shard group and routes everything between
//! them:
//! - Gates shard session starts through the admission queue
//! - Relays cache, REST and evaluation requests from workers
//! - Publishes worker dispatches to NATS (or logs them in local mode)
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use arrakis_cluster::collab::{fetch_bootstrap, Collaborators, DispatchSink, HttpRest, MemoryCache, TracingSink};
use arrakis_cluster::config::ClusterConfig;
use arrakis_cluster::health::{self, AppState};
use arrakis_cluster::metrics::ClusterMetrics;
use arrakis_cluster::nats::NatsSink;
use arrakis_cluster::worker::ProcessSpawner;
use arrakis_cluster::Cluster;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = ClusterConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_cluster={}", config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?)
                .add_directive("twilight_http=info".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_start = config.shard_start,
        shards_per_worker = config.shards_per_worker,
        "Starting Arrakis Cluster"
    );

    let metrics = ClusterMetrics::install()?;
    info!("Prometheus metrics initialized");

    let bootstrap = fetch_bootstrap(&config.discord_token).await?;

    let nats = match config.nats_url {
        Some(ref url) => match NatsSink::connect(url).await {
            Ok(sink) => Some(sink),
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                None
            }
        },
        None => {
            info!("No NATS_URL configured - running in local mode");
            None
        }
    };

    let sink: Arc<dyn DispatchSink> = match nats {
        Some(ref nats) => Arc::new(nats.clone()),
        None => Arc::new(TracingSink),
    };
    let rest = HttpRest::new(config.api_base_url.clone(), config.discord_token.clone())
        .map_err(|e| anyhow::anyhow!(e))?;
    let collab = Collaborators::new(Arc::new(MemoryCache::new()), Arc::new(rest), sink).with_metrics(metrics.clone());

    let options = config.to_options();
    let layout = options.resolve(&bootstrap)?;
    let spawner = ProcessSpawner::from_command_line(&config.worker_command, layout.worker_count)?;

    let cluster = Cluster::new(options, bootstrap, Arc::new(spawner), collab)?;
    cluster.start()?;

    let app_state = AppState {
        cluster_state: cluster.state(),
        nats: nats.clone(),
        metrics,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    tokio::select! {
        result = cluster.run() => {
            if let Err(e) = result {
                error!(error = %e, "Cluster router error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down cluster...");
    cluster.shutdown();

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Cluster shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
