use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::TokenAuthenticator;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::events::{SecurityEventSink, TracingEventSink};
use crate::mtls::ClientIdentity;
use crate::node::{ConnectionManager, GrpcTransportFactory, NodeRegistry};
use crate::pki::CertificateAuthority;
use crate::store::{Inventory, MemoryStore};

pub async fn run(config: Config) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Tether daemon starting");

    let events: Arc<dyn SecurityEventSink> = Arc::new(TracingEventSink);

    // TLS material: CA first, then the panel's client identity signed by it
    let ca = CertificateAuthority::new(config.ssl_dir(), events.clone());
    let ca_identity = ca
        .get_or_create_ca(false)
        .context("loading certificate authority")?;
    info!(
        ssl_dir = %ca.ssl_dir().display(),
        not_after = %ca_identity.not_after,
        "Certificate authority ready"
    );

    let identity = if config.transport.insecure {
        warn!("transport.insecure is set, nodes will be dialled without TLS");
        None
    } else {
        Some(ClientIdentity::from_authority(&ca).context("building panel client identity")?)
    };

    let store = match &config.inventory_file {
        Some(path) => {
            let inventory = Inventory::load(path)?;
            info!(
                path = %path.display(),
                nodes = inventory.nodes.len(),
                users = inventory.users.len(),
                "Inventory loaded"
            );
            Arc::new(MemoryStore::from_inventory(inventory))
        }
        None => {
            warn!("no inventory_file configured, starting with an empty store");
            Arc::new(MemoryStore::new())
        }
    };

    let resources = Arc::new(config.disk_guard());

    let authenticator = Arc::new(TokenAuthenticator::new(
        store.clone(),
        Arc::new(SystemClock),
        events.clone(),
        resources.clone(),
        config.auth_settings(),
    ));

    let settings = config.connection_settings();
    let manager = ConnectionManager::new(
        Arc::new(NodeRegistry::new()),
        store.clone(),
        events.clone(),
        resources,
        Arc::new(GrpcTransportFactory::new(
            config.transport.insecure,
            settings.handshake_timeout,
        )),
        settings,
    );

    let added = manager
        .startup(identity.as_ref())
        .await
        .context("starting node connections")?;
    info!(nodes = added, "Node connections started");

    // Spawn expired-token purge
    if config.auth.cleanup_interval_mins > 0 {
        let auth = authenticator.clone();
        let interval_secs = config.auth.cleanup_interval_mins * 60;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match auth.cleanup_expired().await {
                    Ok(purged) => {
                        info!(purged, "Expired token cleanup completed");
                    }
                    Err(e) => {
                        warn!(error = %e, "Expired token cleanup failed");
                        continue;
                    }
                }
                match auth.security_summary().await {
                    Ok(summary) => info!(
                        active_tokens = summary.active_tokens,
                        expired_tokens = summary.expired_tokens,
                        failed_attempts_24h = summary.failed_attempts_24h,
                        locked_out_nodes = summary.locked_out_nodes,
                        last_cleanup = ?summary.last_cleanup,
                        "Security summary"
                    ),
                    Err(e) => warn!(error = %e, "Security summary failed"),
                }
            }
        });
    }

    shutdown_signal().await;

    manager.stop_all().await;

    info!("Tether daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
