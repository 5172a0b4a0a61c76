//! Reconciliation and renewal loops
//!
//! Two long-lived tasks keep the live proxy tracking declared state:
//!
//! - the reconciliation loop polls Docker for labeled containers,
//!   fingerprints the endpoint set and pushes changed state into the
//!   supervisor
//! - the renewal loop reissues certificates whose reissue timestamp has
//!   passed and reloads the proxy so it picks up the new PEM files
//!
//! Both loops only log their errors: a failed discovery keeps the old
//! fingerprint so the next tick retries, and one domain failing to
//! reissue never blocks the rest of the batch.

use crate::certs::{CertificateProvider, CertificateStore};
use crate::docker::DockerMonitor;
use crate::endpoint::fingerprint;
use crate::process::HaproxyManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Poll Docker on a fixed tick and push changed endpoint sets into the
/// supervisor. `initial_fingerprint` carries the state already applied at
/// bootstrap so the first tick does not trigger a spurious reload.
pub async fn reconcile_loop(
    monitor: DockerMonitor,
    manager: HaproxyManager,
    initial_fingerprint: Option<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut last_fingerprint = initial_fingerprint;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(RECONCILE_INTERVAL) => {
                let endpoints = match monitor.discover().await {
                    Ok(endpoints) => endpoints,
                    Err(e) => {
                        warn!(error = %e, "Could not discover endpoints");
                        continue;
                    }
                };

                let fp = fingerprint(&endpoints);
                if last_fingerprint == Some(fp) {
                    debug!(fingerprint = format_args!("{:016x}", fp), "Endpoint set unchanged");
                    continue;
                }

                info!(
                    endpoints = endpoints.len(),
                    fingerprint = format_args!("{:016x}", fp),
                    "Endpoint set changed, reloading proxy"
                );
                match manager.set_state(endpoints).await {
                    Ok(()) => last_fingerprint = Some(fp),
                    // Keep the old fingerprint so the next tick retries
                    Err(e) => error!(error = %e, "Could not apply new endpoint state"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Reissue certificates that have reached their reissue timestamp and
/// reload the proxy when at least one succeeded.
pub async fn renewal_loop(
    store: Arc<CertificateStore>,
    manager: HaproxyManager,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                let domains = store.domains_to_reissue().await;
                if domains.is_empty() {
                    continue;
                }

                info!(count = domains.len(), domains = ?domains, "Certificates due for reissue");
                let mut reissued = 0;
                for domain in domains {
                    match store.certificate_for_domain(&domain).await {
                        Ok(_) => reissued += 1,
                        Err(e) => error!(domain = %domain, error = %e, "Could not reissue certificate"),
                    }
                }

                if reissued > 0 {
                    info!(reissued, "Reloading proxy to pick up reissued certificates");
                    if let Err(e) = manager.reload().await {
                        error!(error = %e, "Could not reload proxy after reissue");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
