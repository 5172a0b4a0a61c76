//! Startup configuration read from the environment

use std::path::PathBuf;

/// Internal port the HTTP-01 challenge listener binds to. The generated
/// proxy config routes `/.well-known/acme-challenge` traffic here.
pub const AUTH_PORT_HTTP: u16 = 5002;

/// Internal port the TLS-ALPN-01 challenge listener binds to.
pub const AUTH_PORT_HTTPS: u16 = 5003;

/// Port of the optional static file server used as the catch-all backend.
pub const STATIC_SERVER_PORT: u16 = 8080;

/// Let's Encrypt staging directory. The default, so a misconfigured host
/// burns staging quota instead of production rate limits.
pub const LETS_ENCRYPT_STAGING: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Settings resolved once at startup from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// ACME account email (`AUTOCERT_EMAIL`). Immutable once persisted.
    pub email: String,
    /// Organization used in self-signed certificates (`AUTOCERT_ORGANISATION`).
    pub organization: String,
    /// Root directory for persisted state and PEM files (`CONFIG_DIR`).
    pub config_dir: PathBuf,
    /// Path to the HAProxy binary (`HAPROXY_BIN`).
    pub haproxy_bin: PathBuf,
    /// If set, serve this directory on the static server port as the
    /// catch-all backend (`STATIC_WWW_DIR`).
    pub static_www_dir: Option<PathBuf>,
    /// ACME directory URL (`ACME_DIRECTORY_URL`), staging by default.
    pub acme_directory_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            email: env_or("AUTOCERT_EMAIL", "demo@example.com"),
            organization: env_or("AUTOCERT_ORGANISATION", "HAProxy"),
            config_dir: PathBuf::from(env_or("CONFIG_DIR", "/var/lib/docker-lb")),
            haproxy_bin: PathBuf::from(env_or("HAPROXY_BIN", "/usr/local/sbin/haproxy")),
            static_www_dir: std::env::var("STATIC_WWW_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            acme_directory_url: env_or("ACME_DIRECTORY_URL", LETS_ENCRYPT_STAGING),
        }
    }

    /// Port of the default local backend, or 0 when no static directory is
    /// configured and the synthesized config should have no catch-all.
    pub fn default_local_server_port(&self) -> u16 {
        if self.static_www_dir.is_some() {
            STATIC_SERVER_PORT
        } else {
            0
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
