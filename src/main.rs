//! pathwatch - network reachability telemetry collector.
//!
//! Resolves a declarative target file into per-target probe schedulers and
//! serves their cumulative results over HTTP.

mod config;
mod probe;
mod scheduler;
mod targets;
mod web;

use config::ServerConfig;
use probe::IcmpIdAllocator;
use scheduler::{ProbeSet, Registry};
use targets::{read_conf, ConfigStore, SrvDiscovery};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pathwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pathwatch on port {}...", cfg.http_port);
    tracing::info!(
        "Using target file {} as runner {}",
        cfg.config_path.display(),
        cfg.hostname
    );

    // Discovery settings are read once; changing them requires a restart
    let conf = read_conf(&cfg.config_path).await?;
    let discovery = Arc::new(SrvDiscovery::new(conf.nameserver, conf.nameserver_timeout)?);

    let store = Arc::new(ConfigStore::open(&cfg.config_path, &cfg.hostname, discovery).await?);
    let initial = store.current();
    for rejected in &initial.rejected {
        tracing::warn!("Rejected record: {}", rejected);
    }

    let registry = Arc::new(Registry::new(
        ProbeSet::native(),
        Arc::new(IcmpIdAllocator::new()),
        cfg.ipv6,
    ));
    registry.reconcile(&initial).await;

    tokio::spawn(reload_loop(store.clone(), registry.clone()));

    // Start web server
    let server = Server::new(cfg, store, registry.clone());
    server.start(shutdown_signal()).await?;

    registry.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Reload on SIGHUP and every `conf.refresh` while it is non-zero.
async fn reload_loop(store: Arc<ConfigStore>, registry: Arc<Registry>) {
    #[cfg(unix)]
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    loop {
        let refresh = store.current().conf.refresh;
        let periodic = async {
            if refresh.is_zero() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(refresh).await;
        };
        let sighup = async {
            #[cfg(unix)]
            if let Some(sig) = hangup.as_mut() {
                sig.recv().await;
                return;
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = sighup => tracing::info!("Received SIGHUP, reloading"),
            _ = periodic => tracing::debug!(?refresh, "Periodic reload"),
        }

        if let Err(e) = registry.reload(&store).await {
            tracing::error!(error = %e, "Reload failed, keeping previous configuration");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
    tracing::info!("Shutting down schedulers...");
}
