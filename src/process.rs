//! HAProxy child process supervision
//!
//! The supervisor owns the declared endpoint state and the child process
//! handle. Every state change regenerates the config file and restarts
//! the child: HAProxy is treated as an opaque binary taking `-f <cfg>`,
//! and a restart is the only reload mechanism used. All transitions are
//! serialized behind one mutex, so `start`/`stop`/`reload`/`set_state`
//! and the watchdog never interleave.
//!
//! The watchdog checks the child under that same lock and is keyed to a
//! generation counter: an orderly `stop` bumps the generation, so a
//! watchdog from a previous generation exits instead of restarting a
//! deliberately stopped proxy.

use crate::certs::CertificateProvider;
use crate::endpoint::ProxyEndpoint;
use crate::haproxy::compute_config;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HaproxyManagerConfig {
    /// Path to the HAProxy binary
    pub binary_path: PathBuf,
    /// Where the generated config is written before each start
    pub config_path: PathBuf,
    /// Port of the catch-all local backend, 0 to disable
    pub default_local_server_port: u16,
}

impl HaproxyManagerConfig {
    pub fn new(binary_path: PathBuf, default_local_server_port: u16) -> Self {
        Self {
            binary_path,
            config_path: PathBuf::from("/tmp/haproxy.conf"),
            default_local_server_port,
        }
    }
}

struct Supervised {
    child: Option<Child>,
    /// Bumped on every spawn and kill; watchdogs from older generations
    /// retire instead of acting on a child they no longer own.
    generation: u64,
    endpoints: Vec<ProxyEndpoint>,
}

/// Supervisor for the HAProxy child process. Cheap to clone; clones share
/// the same supervised state.
#[derive(Clone)]
pub struct HaproxyManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: HaproxyManagerConfig,
    certs: Arc<dyn CertificateProvider>,
    supervised: Mutex<Supervised>,
}

impl HaproxyManager {
    pub fn new(config: HaproxyManagerConfig, certs: Arc<dyn CertificateProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                certs,
                supervised: Mutex::new(Supervised {
                    child: None,
                    generation: 0,
                    endpoints: Vec::new(),
                }),
            }),
        }
    }

    /// Start the proxy if it is not already running. A config or spawn
    /// failure returns the error and leaves the proxy stopped.
    ///
    /// Returns a boxed future rather than being declared `async fn`: the
    /// watchdog this spawns can itself call back into `start`, and the
    /// compiler cannot compute the hidden type of a recursive `async fn`'s
    /// opaque future within its own defining scope.
    pub fn start(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>>
    {
        Box::pin(async move {
            let mut supervised = self.inner.supervised.lock().await;
            self.start_locked(&mut supervised).await
        })
    }

    /// Kill the child and wait for it to exit. No-op when stopped.
    pub async fn stop(&self) {
        let mut supervised = self.inner.supervised.lock().await;
        self.stop_locked(&mut supervised).await;
    }

    /// Regenerate the config and restart the child. When config
    /// generation fails the previous child keeps running with the
    /// previous config.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let mut supervised = self.inner.supervised.lock().await;
        self.reload_locked(&mut supervised).await
    }

    /// Replace the declared endpoint state and reload.
    pub async fn set_state(&self, endpoints: Vec<ProxyEndpoint>) -> anyhow::Result<()> {
        let mut supervised = self.inner.supervised.lock().await;
        supervised.endpoints = endpoints;
        self.reload_locked(&mut supervised).await
    }

    pub async fn is_running(&self) -> bool {
        self.inner.supervised.lock().await.child.is_some()
    }

    async fn reload_locked(&self, supervised: &mut Supervised) -> anyhow::Result<()> {
        if supervised.child.is_none() {
            return self.start_locked(supervised).await;
        }

        // Regenerate before stopping, so a synthesis failure aborts the
        // reload with the old child still serving traffic
        self.write_config(&supervised.endpoints)
            .await
            .context("Could not re-generate config")?;

        self.stop_locked(supervised).await;
        self.start_locked(supervised).await
    }

    async fn start_locked(&self, supervised: &mut Supervised) -> anyhow::Result<()> {
        if supervised.child.is_some() {
            return Ok(());
        }

        self.write_config(&supervised.endpoints)
            .await
            .context("Could not re-generate config")?;

        info!(binary = %self.inner.config.binary_path.display(), "Starting HAProxy");
        let mut child = Command::new(&self.inner.config.binary_path)
            .arg("-f")
            .arg(&self.inner.config.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Could not start HAProxy ({})",
                    self.inner.config.binary_path.display()
                )
            })?;

        let pid = child.id().unwrap_or(0);
        info!(pid, "HAProxy started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        info!(target: "haproxy", "{}", line);
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!(target: "haproxy", "{}", line);
                    }
                }
            });
        }

        supervised.child = Some(child);
        supervised.generation += 1;

        let manager = self.clone();
        let generation = supervised.generation;
        tokio::spawn(async move {
            manager.watchdog(generation).await;
        });

        Ok(())
    }

    async fn stop_locked(&self, supervised: &mut Supervised) {
        let Some(mut child) = supervised.child.take() else {
            return;
        };
        supervised.generation += 1;

        info!("Killing HAProxy");
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "Could not kill HAProxy");
        }
        match child.wait().await {
            Ok(status) => info!(?status, "HAProxy exited"),
            Err(e) => warn!(error = %e, "Could not reap HAProxy"),
        }
    }

    async fn write_config(&self, endpoints: &[ProxyEndpoint]) -> anyhow::Result<()> {
        let contents = compute_config(
            endpoints,
            &*self.inner.certs,
            self.inner.config.default_local_server_port,
        )
        .await?;

        info!(path = %self.inner.config.config_path.display(), "Updating HAProxy configuration");
        write_config_file(&self.inner.config.config_path, contents.as_bytes())
            .with_context(|| {
                format!(
                    "Could not write {}",
                    self.inner.config.config_path.display()
                )
            })
    }

    /// Restart the child when it dies unexpectedly. Runs until the
    /// generation it was spawned for is superseded.
    async fn watchdog(self, generation: u64) {
        loop {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;

            let died = {
                let mut supervised = self.inner.supervised.lock().await;
                if supervised.generation != generation {
                    return;
                }
                let Some(child) = supervised.child.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(?status, "HAProxy has died. Restarting");
                        supervised.child = None;
                        supervised.generation += 1;
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        warn!(error = %e, "Could not poll HAProxy");
                        false
                    }
                }
            };

            if died {
                tokio::time::sleep(RESTART_DELAY).await;
                if let Err(e) = self.start().await {
                    error!(error = %e, "Could not restart HAProxy");
                }
                // start() spawned a watchdog for the new generation
                return;
            }
        }
    }
}

fn write_config_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(data)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct TestCertificateProvider;

    #[async_trait]
    impl CertificateProvider for TestCertificateProvider {
        async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("/certs/{}.pem", domain)))
        }

        async fn self_signed(&self, domain: &str) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("/certs/selfsigned-{}.pem", domain)))
        }

        fn auth_service_port(&self, _ssl: bool) -> u16 {
            5002
        }
    }

    /// Provider whose issuance always fails, for reload-failure paths
    struct FailingCertificateProvider;

    #[async_trait]
    impl CertificateProvider for FailingCertificateProvider {
        async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf> {
            anyhow::bail!("no certificate for {}", domain)
        }

        async fn self_signed(&self, domain: &str) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("/certs/selfsigned-{}.pem", domain)))
        }

        fn auth_service_port(&self, _ssl: bool) -> u16 {
            5002
        }
    }

    fn endpoint(domain: &str, ssl: bool) -> ProxyEndpoint {
        ProxyEndpoint {
            frontend_domain: domain.to_string(),
            frontend_path: String::new(),
            backend_ip: "1.2.3.4".to_string(),
            backend_port: 80,
            backend_path: String::new(),
            ssl_auto_cert: ssl,
            order: None,
        }
    }

    /// A manager whose "proxy binary" is `tail`, so `tail -f <cfg>` gives
    /// a harmless long-running child.
    fn manager_with(
        dir: &TempDir,
        binary: &str,
        certs: Arc<dyn CertificateProvider>,
    ) -> HaproxyManager {
        let config = HaproxyManagerConfig {
            binary_path: PathBuf::from(binary),
            config_path: dir.path().join("haproxy.conf"),
            default_local_server_port: 0,
        };
        HaproxyManager::new(config, certs)
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "tail", Arc::new(TestCertificateProvider));

        assert!(!manager.is_running().await);
        manager.start().await.unwrap();
        assert!(manager.is_running().await);
        assert!(dir.path().join("haproxy.conf").exists());

        // Start is a no-op while running
        manager.start().await.unwrap();
        assert!(manager.is_running().await);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_stopped() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(
            &dir,
            "/nonexistent/haproxy-binary",
            Arc::new(TestCertificateProvider),
        );

        assert!(manager.start().await.is_err());
        assert!(!manager.is_running().await);
        // The config was written before the spawn was attempted
        assert!(dir.path().join("haproxy.conf").exists());
    }

    #[tokio::test]
    async fn test_set_state_writes_endpoint_config() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "tail", Arc::new(TestCertificateProvider));

        manager
            .set_state(vec![endpoint("foo.com", false)])
            .await
            .unwrap();
        assert!(manager.is_running().await);

        let cfg = std::fs::read_to_string(dir.path().join("haproxy.conf")).unwrap();
        assert!(cfg.contains("server service0 1.2.3.4:80"));
        assert!(cfg.contains("-i foo.com"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_old_child() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "tail", Arc::new(FailingCertificateProvider));

        // Starts fine with no SSL domains (self-signed fallback only)
        manager.set_state(Vec::new()).await.unwrap();
        assert!(manager.is_running().await);
        let cfg_before = std::fs::read_to_string(dir.path().join("haproxy.conf")).unwrap();

        // An SSL endpoint forces certificate resolution, which fails; the
        // reload aborts and the old child keeps running
        let result = manager.set_state(vec![endpoint("foo.com", true)]).await;
        assert!(result.is_err());
        assert!(manager.is_running().await);

        let cfg_after = std::fs::read_to_string(dir.path().join("haproxy.conf")).unwrap();
        assert_eq!(cfg_before, cfg_after);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reload_restarts_child() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "tail", Arc::new(TestCertificateProvider));

        manager.start().await.unwrap();
        assert!(manager.is_running().await);

        manager.reload().await.unwrap();
        assert!(manager.is_running().await);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }
}
