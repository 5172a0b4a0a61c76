//! Endpoint discovery from the Docker daemon
//!
//! Containers advertise publishing intent via labels:
//!
//! | Label                   | Default          | Meaning                       |
//! |-------------------------|------------------|-------------------------------|
//! | `publish.domain`        | (required)       | Frontend hostname             |
//! | `publish.port`          | `80`             | Backend port                  |
//! | `publish.path`          | `/`              | Frontend and backend path     |
//! | `publish.path.frontend` | = `publish.path` | Frontend path override        |
//! | `publish.path.backend`  | = `publish.path` | Backend path override         |
//! | `publish.ssl`           | `false`          | `yes`/`true`/`on`/`1` enables |
//!
//! A container attached to several networks yields one endpoint per
//! network interface.

use crate::endpoint::ProxyEndpoint;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const LABEL_DOMAIN: &str = "publish.domain";
const LABEL_PORT: &str = "publish.port";
const LABEL_PATH: &str = "publish.path";
const LABEL_PATH_FRONTEND: &str = "publish.path.frontend";
const LABEL_PATH_BACKEND: &str = "publish.path.backend";
const LABEL_SSL: &str = "publish.ssl";

const DEFAULT_BACKEND_PORT: u16 = 80;

/// Watches the Docker daemon for containers that want to be published.
pub struct DockerMonitor {
    client: Docker,
}

impl DockerMonitor {
    /// Connect to the Docker daemon, honoring `DOCKER_HOST` when set and
    /// falling back to the platform socket defaults.
    pub async fn new() -> anyhow::Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// List running containers and extract one endpoint per labeled
    /// container network interface. A listing failure is returned to the
    /// caller; malformed labels on individual containers are logged and
    /// the defaults used instead.
    pub async fn discover(&self) -> anyhow::Result<Vec<ProxyEndpoint>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| anyhow::anyhow!("Could not enumerate containers: {}", e))?;

        let mut endpoints = Vec::new();

        for container in containers {
            let cid: String = container
                .id
                .as_deref()
                .unwrap_or("unknown")
                .chars()
                .take(10)
                .collect();

            let Some(labels) = container.labels.as_ref() else {
                continue;
            };
            let Some(domain) = labels.get(LABEL_DOMAIN) else {
                continue;
            };

            let port = parse_port(&cid, labels);
            let (path_frontend, path_backend) = parse_paths(labels);
            let ssl = labels.get(LABEL_SSL).is_some_and(|v| is_truthy(v));

            let Some(networks) = container
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
            else {
                continue;
            };

            for net in networks.values() {
                let Some(ip) = net.ip_address.as_ref().filter(|ip| !ip.is_empty()) else {
                    continue;
                };

                info!(
                    container = %cid,
                    frontend = format_args!("{}{}", domain, path_frontend),
                    backend = format_args!("{}:{}{}", ip, port, path_backend),
                    ssl,
                    "Exposing endpoint"
                );
                endpoints.push(ProxyEndpoint {
                    frontend_domain: domain.clone(),
                    frontend_path: path_frontend.clone(),
                    backend_ip: ip.clone(),
                    backend_port: port,
                    backend_path: path_backend.clone(),
                    ssl_auto_cert: ssl,
                    order: None,
                });
            }
        }

        Ok(endpoints)
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

fn parse_port(cid: &str, labels: &HashMap<String, String>) -> u16 {
    let Some(value) = labels.get(LABEL_PORT) else {
        return DEFAULT_BACKEND_PORT;
    };
    match value.parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            warn!(container = %cid, value = %value, "'publish.port' is not a valid port, using default");
            DEFAULT_BACKEND_PORT
        }
    }
}

fn parse_paths(labels: &HashMap<String, String>) -> (String, String) {
    let base = labels.get(LABEL_PATH).map(String::as_str).unwrap_or("/");
    let frontend = labels
        .get(LABEL_PATH_FRONTEND)
        .map(String::as_str)
        .unwrap_or(base);
    let backend = labels
        .get(LABEL_PATH_BACKEND)
        .map(String::as_str)
        .unwrap_or(base);
    (frontend.to_string(), backend.to_string())
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "yes" | "true" | "on" | "1")
}
