use dockhand::acme::AcmeIssuer;
use dockhand::certs::{CertificateProvider, CertificateStore, StoreConfig};
use dockhand::config::{Settings, AUTH_PORT_HTTP, AUTH_PORT_HTTPS, STATIC_SERVER_PORT};
use dockhand::docker::DockerMonitor;
use dockhand::endpoint::fingerprint;
use dockhand::process::{HaproxyManager, HaproxyManagerConfig};
use dockhand::reconcile::{reconcile_loop, renewal_loop};
use dockhand::static_files::StaticFileServer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockhand=info".parse().expect("valid log directive")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        email = %settings.email,
        config_dir = %settings.config_dir.display(),
        haproxy_bin = %settings.haproxy_bin.display(),
        static_www_dir = ?settings.static_www_dir,
        acme_directory = %settings.acme_directory_url,
        "Starting dockhand"
    );

    // Certificate store; any state corruption here is fatal
    let issuer = AcmeIssuer::new(
        settings.acme_directory_url.clone(),
        settings.email.clone(),
        AUTH_PORT_HTTP,
        AUTH_PORT_HTTPS,
    );
    let store = Arc::new(
        CertificateStore::new(
            StoreConfig {
                config_dir: settings.config_dir.clone(),
                email: settings.email.clone(),
                organization: settings.organization.clone(),
                auth_port_http: AUTH_PORT_HTTP,
                auth_port_https: AUTH_PORT_HTTPS,
            },
            issuer,
        )
        .map_err(|e| {
            error!(error = %e, "Could not initialize certificate store");
            e
        })?,
    );

    let manager = HaproxyManager::new(
        HaproxyManagerConfig::new(
            settings.haproxy_bin.clone(),
            settings.default_local_server_port(),
        ),
        Arc::clone(&store) as Arc<dyn CertificateProvider>,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Optional static catch-all backend
    if let Some(dir) = settings.static_www_dir.clone() {
        let server = StaticFileServer::new(dir, STATIC_SERVER_PORT);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(rx).await {
                error!(error = %e, "Static file server error");
            }
        });
    }

    let monitor = DockerMonitor::new().await.map_err(|e| {
        error!(error = %e, "Could not connect to Docker");
        e
    })?;

    // Apply the initial state; a failed first start is fatal
    let initial = match monitor.discover().await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            warn!(error = %e, "Initial discovery failed, starting with no endpoints");
            Vec::new()
        }
    };
    let initial_fingerprint = fingerprint(&initial);
    info!(endpoints = initial.len(), "Applying initial endpoint state");
    manager.set_state(initial).await.map_err(|e| {
        error!(error = %e, "Could not start HAProxy");
        e
    })?;

    tokio::spawn(reconcile_loop(
        monitor,
        manager.clone(),
        Some(initial_fingerprint),
        shutdown_rx.clone(),
    ));
    tokio::spawn(renewal_loop(
        Arc::clone(&store),
        manager.clone(),
        shutdown_rx.clone(),
    ));

    // Run until killed
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    manager.stop().await;

    info!("Shutdown complete");
    Ok(())
}
