//! HAProxy configuration synthesis
//!
//! Maps a flat list of endpoints onto HAProxy's layered model:
//!
//! - one backend per distinct (address, port, backend path, frontend path),
//!   indexed in insertion order
//! - one frontend per distinct (domain, ssl); an SSL-enabled endpoint
//!   contributes a mapping to both the plain and the SSL frontend
//! - per-frontend mappings sorted by routing order (explicit, or derived
//!   from the frontend path length so longer prefixes are tried first)
//!   and emitted as `use_backend` rules relying on HAProxy's first-match
//!   semantics
//!
//! The output is a deterministic function of the endpoint list and the
//! certificate provider's state: identical inputs produce byte-identical
//! config text.

use crate::certs::CertificateProvider;
use crate::endpoint::{normalize_path, ProxyEndpoint};
use tracing::debug;

/// Base for derived routing priorities. Longer frontend paths get lower
/// values and are emitted first, so more specific prefixes win the
/// first-match pass.
const DERIVED_ORDER_BASE: i32 = 500;

struct BackendRecord {
    /// 1-based emission index (`backend beN`)
    index: usize,
    host: String,
    port: u16,
    path_be: String,
    path_fe: String,
    order: i32,
}

struct MappingRecord {
    path: String,
    /// Position of the target backend in the backends list
    backend: usize,
}

struct FrontendRecord {
    domain: String,
    ssl: bool,
    mappings: Vec<MappingRecord>,
}

fn backend_for(backends: &mut Vec<BackendRecord>, ep: &ProxyEndpoint) -> usize {
    let path_be = normalize_path(&ep.backend_path);
    let path_fe = normalize_path(&ep.frontend_path);

    if let Some(pos) = backends.iter().position(|b| {
        b.host == ep.backend_ip
            && b.port == ep.backend_port
            && b.path_be == path_be
            && b.path_fe == path_fe
    }) {
        return pos;
    }

    // Unless explicitly overridden, processing order follows the frontend
    // path length: longer paths get a lower order.
    let order = ep
        .order
        .unwrap_or(DERIVED_ORDER_BASE - ep.frontend_path.len() as i32);

    backends.push(BackendRecord {
        index: backends.len() + 1,
        host: ep.backend_ip.clone(),
        port: ep.backend_port,
        path_be,
        path_fe,
        order,
    });
    backends.len() - 1
}

fn frontend_for(frontends: &mut Vec<FrontendRecord>, ep: &ProxyEndpoint, ssl: bool) -> usize {
    if let Some(pos) = frontends
        .iter()
        .position(|f| f.domain == ep.frontend_domain && f.ssl == ssl)
    {
        return pos;
    }

    frontends.push(FrontendRecord {
        domain: ep.frontend_domain.clone(),
        ssl,
        mappings: Vec::new(),
    });
    frontends.len() - 1
}

/// Synthesize the full HAProxy configuration for the given endpoint set.
///
/// `default_local_server_port` of 0 disables the catch-all backend.
/// Certificate paths are resolved through the provider, which may issue
/// on demand; a resolution failure aborts the synthesis.
pub async fn compute_config<P>(
    endpoints: &[ProxyEndpoint],
    certs: &P,
    default_local_server_port: u16,
) -> anyhow::Result<String>
where
    P: CertificateProvider + ?Sized,
{
    let mut backends: Vec<BackendRecord> = Vec::new();
    let mut frontends: Vec<FrontendRecord> = Vec::new();

    for ep in endpoints {
        let be = backend_for(&mut backends, ep);

        let fe = frontend_for(&mut frontends, ep, false);
        frontends[fe].mappings.push(MappingRecord {
            path: normalize_path(&ep.frontend_path),
            backend: be,
        });

        if ep.ssl_auto_cert {
            let fe = frontend_for(&mut frontends, ep, true);
            frontends[fe].mappings.push(MappingRecord {
                path: normalize_path(&ep.frontend_path),
                backend: be,
            });
        }
    }

    // Resolve one certificate per SSL frontend. HAProxy refuses to bind
    // 443 without at least one certificate, so fall back to a self-signed
    // one when no SSL frontend exists.
    let mut fe_certs: Vec<String> = Vec::new();
    for fe in frontends.iter().filter(|f| f.ssl) {
        let path = certs.certificate_for_domain(&fe.domain).await?;
        fe_certs.push(format!("crt {}", path.display()));
    }
    if fe_certs.is_empty() {
        let path = certs.self_signed("").await?;
        fe_certs.push(format!("crt {}", path.display()));
    }

    let mut fe_http: Vec<String> = vec![
        "frontend http-in".to_string(),
        "  mode http".to_string(),
        "  bind 0.0.0.0:80".to_string(),
        "  acl url_challenge path_beg /.well-known/acme-challenge".to_string(),
    ];
    let mut fe_be_http: Vec<String> =
        vec!["  use_backend be_challenge_http if url_challenge".to_string()];

    let mut fe_https: Vec<String> = vec![
        "frontend https-in".to_string(),
        "  mode http".to_string(),
        format!("  bind 0.0.0.0:443 ssl {}", fe_certs.join(" ")),
    ];
    let mut fe_be_https: Vec<String> = Vec::new();

    for (fi, fe) in frontends.iter_mut().enumerate() {
        let (target_acls, target_bes) = if fe.ssl {
            (&mut fe_https, &mut fe_be_https)
        } else {
            (&mut fe_http, &mut fe_be_http)
        };

        let mut acl_common: Vec<String> = Vec::new();

        if !fe.domain.is_empty() {
            let acl_name = format!("host_fe{}", fi);
            target_acls.push(format!(
                "  acl {} req.hdr(Host),regsub(:[0-9]+$,) -i {}",
                acl_name, fe.domain
            ));
            acl_common.push(acl_name);
        }

        // Stable sort: equal-order mappings keep their insertion order
        fe.mappings
            .sort_by_key(|m| backends[m.backend].order);

        for (mi, mapping) in fe.mappings.iter().enumerate() {
            let backend = &backends[mapping.backend];
            let mut acl_list = acl_common.clone();

            debug!(
                order = backend.order,
                backend = backend.index,
                path = %mapping.path,
                "Mapping backend"
            );

            if mapping.path != "/" {
                let acl_name = format!("host_fe{}_url{}", fi, mi);
                target_acls.push(format!("  acl {} path_beg {}", acl_name, mapping.path));
                acl_list.push(acl_name);
            }

            if acl_list.is_empty() {
                target_bes.push(format!("  use_backend be{}", backend.index));
            } else {
                target_bes.push(format!(
                    "  use_backend be{} if {}",
                    backend.index,
                    acl_list.join(" ")
                ));
            }
        }
    }

    let mut be_all: Vec<String> = Vec::new();
    for (idx, be) in backends.iter().enumerate() {
        be_all.push(format!("backend be{}", be.index));
        be_all.push("  mode http".to_string());
        be_all.push("  option httpclose".to_string());
        be_all.push("  option forwardfor".to_string());
        be_all.push(format!("  server service{} {}:{}", idx, be.host, be.port));

        // Rewrite the path prefix when frontend and backend disagree
        if be.path_fe != be.path_be {
            be_all.push(format!(
                "  http-request replace-path {}(.*) {}\\1",
                be.path_fe, be.path_be
            ));
        }

        be_all.push(String::new());
    }

    // Catch-all backend for the local static server
    if default_local_server_port != 0 {
        be_all.push("backend be_local".to_string());
        be_all.push("  mode http".to_string());
        be_all.push("  option httpclose".to_string());
        be_all.push("  option forwardfor".to_string());
        be_all.push(format!(
            "  server local0 127.0.0.1:{}",
            default_local_server_port
        ));
        be_all.push(String::new());

        fe_be_http.push("  use_backend be_local".to_string());
        fe_be_https.push("  use_backend be_local".to_string());
    }

    let mut config: Vec<String> = vec![
        "global".to_string(),
        "  log stdout local0 info".to_string(),
        "  maxconn 4096".to_string(),
        "  tune.ssl.default-dh-param 2048".to_string(),
        "  stats socket /var/run/haproxy.sock mode 600 expose-fd listeners level user".to_string(),
        String::new(),
        "defaults".to_string(),
        "  log     global".to_string(),
        "  timeout connect          5s".to_string(),
        "  timeout client          60s".to_string(),
        "  timeout server          60s".to_string(),
        "  timeout tunnel        3600s".to_string(),
        "  timeout http-keep-alive  1s".to_string(),
        "  timeout http-request    60s".to_string(),
        "  timeout queue           80s".to_string(),
        "  timeout tarpit          30s".to_string(),
        "  option  httplog".to_string(),
        "  option  dontlognull".to_string(),
        "  option  http-server-close".to_string(),
        "  option  forwardfor".to_string(),
        "  backlog 10000".to_string(),
        "  default-server inter 3s rise 2 fall 3".to_string(),
        "  stats   enable".to_string(),
        "  stats   auth  haproxy:st@tspassw0rd".to_string(),
        "  stats   uri   /__ha_stats".to_string(),
        String::new(),
    ];
    config.extend(fe_http);
    config.extend(fe_be_http);
    config.push(String::new());
    config.extend(fe_https);
    config.extend(fe_be_https);
    config.push(String::new());
    config.extend(be_all);
    config.push("backend be_challenge_http".to_string());
    config.push("  mode http".to_string());
    config.push(format!(
        "  server local1 127.0.0.1:{}",
        certs.auth_service_port(false)
    ));
    config.push(String::new());

    Ok(config.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;

    /// Provider double returning sentinel paths, so the synthesizer can
    /// be exercised without any on-disk or network state.
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

    fn endpoint(domain: &str, path: &str, ip: &str, port: u16, ssl: bool) -> ProxyEndpoint {
        ProxyEndpoint {
            frontend_domain: domain.to_string(),
            frontend_path: path.to_string(),
            backend_ip: ip.to_string(),
            backend_port: port,
            backend_path: String::new(),
            ssl_auto_cert: ssl,
            order: None,
        }
    }

    async fn synthesize(endpoints: &[ProxyEndpoint], local_port: u16) -> String {
        compute_config(endpoints, &TestCertificateProvider, local_port)
            .await
            .expect("synthesis should not fail with the test provider")
    }

    #[tokio::test]
    async fn test_empty_state_binds_with_selfsigned_fallback() {
        let cfg = synthesize(&[], 0).await;

        assert!(cfg.contains("bind 0.0.0.0:443 ssl crt <self:>"));
        assert!(cfg.contains("acl url_challenge path_beg /.well-known/acme-challenge"));
        assert!(cfg.contains("use_backend be_challenge_http if url_challenge"));
        assert!(cfg.contains("backend be_challenge_http"));
        assert!(cfg.contains("server local1 127.0.0.1:1234"));
        assert!(!cfg.contains("backend be1"));
        assert!(!cfg.contains("backend be_local"));
    }

    #[tokio::test]
    async fn test_single_ssl_endpoint() {
        let eps = [endpoint("foo.com", "", "1.2.3.4", 80, true)];
        let cfg = synthesize(&eps, 0).await;

        assert!(cfg.contains("backend be1"));
        assert!(cfg.contains("server service0 1.2.3.4:80"));
        assert!(cfg.contains("bind 0.0.0.0:443 ssl crt <letsencrypt:foo.com>"));

        // Non-SSL frontend (index 0) and SSL frontend (index 1) both route
        // foo.com to be1
        assert!(cfg.contains("acl host_fe0 req.hdr(Host),regsub(:[0-9]+$,) -i foo.com"));
        assert!(cfg.contains("use_backend be1 if host_fe0"));
        assert!(cfg.contains("acl host_fe1 req.hdr(Host),regsub(:[0-9]+$,) -i foo.com"));
        assert!(cfg.contains("use_backend be1 if host_fe1"));
    }

    #[tokio::test]
    async fn test_path_length_ordering() {
        let eps = [
            endpoint("foo.com", "", "1.2.3.4", 80, false),
            endpoint("foo.com", "service", "1.2.3.4", 80, false),
        ];
        let cfg = synthesize(&eps, 0).await;

        // The /service mapping (derived order 493) sorts before the root
        // mapping (derived order 500), so the more specific rule is tried
        // first under HAProxy's first-match semantics
        let service_rule = cfg
            .find("use_backend be2 if host_fe0 host_fe0_url0")
            .expect("service rule");
        let root_rule = cfg.find("use_backend be1 if host_fe0\n").expect("root rule");
        assert!(service_rule < root_rule);

        assert!(cfg.contains("acl host_fe0_url0 path_beg /service"));
    }

    #[tokio::test]
    async fn test_explicit_order_wins_over_path_length() {
        let service = endpoint("foo.com", "service", "1.2.3.4", 80, false);
        let mut root = endpoint("foo.com", "", "1.2.3.5", 80, false);
        root.order = Some(1);
        let cfg = synthesize(&[service, root], 0).await;

        // Explicit order 1 on the root mapping beats the derived 493 of
        // /service, inverting the path-length ordering
        let root_rule = cfg.find("use_backend be2 if host_fe0\n").expect("root rule");
        let service_rule = cfg
            .find("use_backend be1 if host_fe0 host_fe0_url1")
            .expect("service rule");
        assert!(root_rule < service_rule);
    }

    #[tokio::test]
    async fn test_path_rewrite_emitted_on_mismatch() {
        let mut ep = endpoint("foo.com", "/api", "1.2.3.4", 80, false);
        ep.backend_path = "/v1".to_string();
        let cfg = synthesize(&[ep], 0).await;

        assert!(cfg.contains("http-request replace-path /api(.*) /v1\\1"));
    }

    #[tokio::test]
    async fn test_no_rewrite_when_paths_match() {
        let mut ep = endpoint("foo.com", "/api", "1.2.3.4", 80, false);
        ep.backend_path = "/api".to_string();
        let cfg = synthesize(&[ep], 0).await;

        assert!(!cfg.contains("replace-path"));
    }

    #[tokio::test]
    async fn test_ssl_duplication() {
        let eps = [endpoint("foo.com", "", "1.2.3.4", 80, true)];
        let cfg = synthesize(&eps, 0).await;

        // Exactly one mapping in the plain frontend and one in the SSL one
        assert_eq!(cfg.matches("use_backend be1 if").count(), 2);
        assert_eq!(cfg.matches("crt <letsencrypt:foo.com>").count(), 1);
    }

    #[tokio::test]
    async fn test_default_local_server_catch_all() {
        let cfg = synthesize(&[], 8080).await;

        assert!(cfg.contains("backend be_local"));
        assert!(cfg.contains("server local0 127.0.0.1:8080"));
        // Unconditional catch-all on both frontends
        assert_eq!(cfg.matches("\n  use_backend be_local").count(), 2);
    }

    #[tokio::test]
    async fn test_backend_dedup() {
        let eps = [
            endpoint("foo.com", "", "1.2.3.4", 80, false),
            endpoint("bar.com", "", "1.2.3.4", 80, false),
        ];
        let cfg = synthesize(&eps, 0).await;

        // Same target, same paths: one backend shared by two frontends
        assert!(cfg.contains("backend be1"));
        assert!(!cfg.contains("backend be2"));
        assert!(cfg.contains("use_backend be1 if host_fe0"));
        assert!(cfg.contains("use_backend be1 if host_fe1"));
    }

    #[tokio::test]
    async fn test_empty_domain_matches_by_path_alone() {
        let eps = [endpoint("", "/svc", "1.2.3.4", 80, false)];
        let cfg = synthesize(&eps, 0).await;

        assert!(!cfg.contains("host_fe0 req.hdr"));
        assert!(cfg.contains("acl host_fe0_url0 path_beg /svc"));
        assert!(cfg.contains("use_backend be1 if host_fe0_url0"));
    }

    #[tokio::test]
    async fn test_synthesis_is_deterministic() {
        let eps = [
            endpoint("foo.com", "", "1.2.3.4", 80, true),
            endpoint("foo.com", "service", "1.2.3.4", 80, true),
            endpoint("bar.com", "/api", "1.2.3.5", 8080, false),
        ];

        let first = synthesize(&eps, 8080).await;
        let second = synthesize(&eps, 8080).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_synthesis_does_not_mutate_input() {
        let eps = vec![
            endpoint("foo.com", "service", "1.2.3.4", 80, true),
            endpoint("foo.com", "", "1.2.3.4", 80, false),
        ];
        let before = eps.clone();

        let _ = synthesize(&eps, 0).await;
        assert_eq!(eps, before);
    }
}
