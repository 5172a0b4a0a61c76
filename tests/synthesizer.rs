//! Integration tests for the full config synthesis pipeline

use async_trait::async_trait;
use dockhand::certs::CertificateProvider;
use dockhand::endpoint::ProxyEndpoint;
use dockhand::haproxy::compute_config;
use std::path::PathBuf;

/// Provider double returning sentinel paths, so synthesis runs without
/// any ACME account or on-disk state.
struct TestCertificateProvider;

#[async_trait]
impl CertificateProvider for TestCertificateProvider {
    async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from(format!("<letsencrypt:{}>", domain)))
    }

    async fn self_signed(&self, domain: &str) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from(format!("<self:{}>", domain)))
    }

    fn auth_service_port(&self, _ssl: bool) -> u16 {
        1234
    }
}

fn endpoint(domain: &str, path: &str, ssl: bool) -> ProxyEndpoint {
    ProxyEndpoint {
        frontend_domain: domain.to_string(),
        frontend_path: path.to_string(),
        backend_ip: "1.2.3.4".to_string(),
        backend_port: 80,
        backend_path: String::new(),
        ssl_auto_cert: ssl,
        order: None,
    }
}

#[tokio::test]
async fn full_config_for_domain_with_two_paths() {
    let endpoints = [
        endpoint("foo.com", "", true),
        endpoint("foo.com", "service", true),
    ];

    let cfg = compute_config(&endpoints, &TestCertificateProvider, 8080)
        .await
        .expect("synthesis");

    // Global and defaults sections are always present
    assert!(cfg.starts_with("global\n"));
    assert!(cfg.contains("\ndefaults\n"));
    assert!(cfg.contains("  maxconn 4096"));
    assert!(cfg.contains("  stats   uri   /__ha_stats"));

    // Both frontends bind; 443 carries the resolved certificate
    assert!(cfg.contains("frontend http-in"));
    assert!(cfg.contains("  bind 0.0.0.0:80"));
    assert!(cfg.contains("frontend https-in"));
    assert!(cfg.contains("  bind 0.0.0.0:443 ssl crt <letsencrypt:foo.com>"));

    // Challenge traffic on port 80 reaches the internal auth service
    assert!(cfg.contains("  acl url_challenge path_beg /.well-known/acme-challenge"));
    assert!(cfg.contains("  use_backend be_challenge_http if url_challenge"));
    assert!(cfg.contains("backend be_challenge_http"));
    assert!(cfg.contains("  server local1 127.0.0.1:1234"));

    // Two distinct backends, one per path pair
    assert!(cfg.contains("backend be1"));
    assert!(cfg.contains("  server service0 1.2.3.4:80"));
    assert!(cfg.contains("backend be2"));
    assert!(cfg.contains("  server service1 1.2.3.4:80"));

    // The catch-all local backend is wired into both frontends
    assert!(cfg.contains("backend be_local"));
    assert!(cfg.contains("  server local0 127.0.0.1:8080"));
    assert_eq!(cfg.matches("\n  use_backend be_local").count(), 2);

    // The /service rule precedes the root rule in each frontend, so the
    // first-match pass tries the more specific path first
    for fi in [0usize, 1] {
        let service = cfg
            .find(&format!("use_backend be2 if host_fe{} host_fe{}_url0", fi, fi))
            .unwrap_or_else(|| panic!("service rule for frontend {}", fi));
        let root = cfg
            .find(&format!("use_backend be1 if host_fe{}\n", fi))
            .unwrap_or_else(|| panic!("root rule for frontend {}", fi));
        assert!(service < root, "frontend {} emits /service before /", fi);
    }
}

#[tokio::test]
async fn empty_state_still_produces_a_servable_config() {
    let cfg = compute_config(&[], &TestCertificateProvider, 0)
        .await
        .expect("synthesis");

    // The HTTPS bind always carries at least one certificate
    assert!(cfg.contains("  bind 0.0.0.0:443 ssl crt <self:>"));
    // The only backend is the challenge one
    assert!(!cfg.contains("backend be1"));
    assert!(!cfg.contains("backend be_local"));
    assert!(cfg.contains("backend be_challenge_http"));
}

#[tokio::test]
async fn synthesis_is_byte_identical_across_calls() {
    let endpoints = [
        endpoint("foo.com", "", true),
        endpoint("bar.com", "/api", false),
        endpoint("foo.com", "service", true),
    ];

    let first = compute_config(&endpoints, &TestCertificateProvider, 8080)
        .await
        .expect("synthesis");
    let second = compute_config(&endpoints, &TestCertificateProvider, 8080)
        .await
        .expect("synthesis");

    assert_eq!(first, second);
}

#[tokio::test]
async fn failing_certificate_resolution_aborts_synthesis() {
    struct FailingProvider;

    #[async_trait]
    impl CertificateProvider for FailingProvider {
        async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf> {
            anyhow::bail!("no certificate for {}", domain)
        }

        async fn self_signed(&self, _domain: &str) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from("<self>"))
        }

        fn auth_service_port(&self, _ssl: bool) -> u16 {
            1234
        }
    }

    let endpoints = [endpoint("foo.com", "", true)];
    let result = compute_config(&endpoints, &FailingProvider, 0).await;
    assert!(result.is_err());
}
