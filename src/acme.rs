//! ACME certificate issuance
//!
//! Issues per-domain certificates through an ACME directory using either:
//! - HTTP-01: the key authorization is served from an internal listener;
//!   the generated proxy config routes `/.well-known/acme-challenge/` on
//!   port 80 to it, so the ACME library never needs to bind port 80.
//! - TLS-ALPN-01: a challenge certificate is presented by an internal TLS
//!   listener speaking the `acme-tls/1` ALPN protocol.
//!
//! Both listeners bind lazily on first issuance and live for the rest of
//! the process. Account registration happens on first use; the resulting
//! credentials are handed back to the caller for persistence.

use anyhow::Context;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OnceCell, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// How long to wait between ACME status polls, and how many polls to
/// attempt before giving up on an order.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Pending HTTP-01 key authorizations, keyed by challenge token
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Pending TLS-ALPN-01 challenge certificates, resolved by SNI during the
/// validation handshake. Unlike a general SNI resolver there is no
/// fallback certificate: non-challenge handshakes are rejected.
#[derive(Default)]
pub struct TlsAlpn01Challenges {
    certs: std::sync::RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for TlsAlpn01Challenges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAlpn01Challenges")
            .field("certs", &"<RwLock<HashMap>>")
            .finish()
    }
}

impl TlsAlpn01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.certs
            .write()
            .expect("challenge cert lock poisoned")
            .insert(domain.to_string(), cert);
    }

    fn remove(&self, domain: &str) {
        self.certs
            .write()
            .expect("challenge cert lock poisoned")
            .remove(domain);
    }
}

impl ResolvesServerCert for TlsAlpn01Challenges {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        if !is_acme_challenge {
            return None;
        }

        let sni = client_hello.server_name()?;
        self.certs
            .read()
            .expect("challenge cert lock poisoned")
            .get(sni)
            .cloned()
    }
}

/// Key and certificate chain returned by a successful issuance, both
/// PEM-encoded and ready to be concatenated into one HAProxy-style file.
pub struct IssuedPem {
    pub private_key_pem: String,
    pub certificate_pem: String,
}

/// ACME issuer bound to one directory and one account email
pub struct AcmeIssuer {
    directory_url: String,
    email: String,
    auth_port_http: u16,
    auth_port_https: u16,
    http01: Http01Challenges,
    tls_alpn: Arc<TlsAlpn01Challenges>,
    listeners: OnceCell<()>,
}

impl AcmeIssuer {
    /// Create an issuer. Challenge listeners are not bound until the
    /// first call to [`issue`](Self::issue).
    pub fn new(
        directory_url: String,
        email: String,
        auth_port_http: u16,
        auth_port_https: u16,
    ) -> Self {
        Self {
            directory_url,
            email,
            auth_port_http,
            auth_port_https,
            http01: Http01Challenges::new(),
            tls_alpn: Arc::new(TlsAlpn01Challenges::new()),
            listeners: OnceCell::new(),
        }
    }

    /// Restore the account from persisted credentials, or register a new
    /// one with the terms of service agreed. Returns the credentials to
    /// persist when a registration happened.
    pub async fn account(
        &self,
        registration: Option<&serde_json::Value>,
    ) -> anyhow::Result<(Account, Option<serde_json::Value>)> {
        if let Some(reg) = registration {
            let credentials: AccountCredentials = serde_json::from_value(reg.clone())
                .context("Could not parse persisted ACME registration")?;
            let account = Account::builder()
                .context("Could not create ACME account builder")?
                .from_credentials(credentials)
                .await
                .context("Could not restore ACME account from persisted registration")?;
            return Ok((account, None));
        }

        info!(email = %self.email, directory = %self.directory_url, "Registering new ACME account");
        let (account, credentials) = Account::builder()
            .context("Could not create ACME account builder")?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .context("Could not register ACME account")?;

        let value = serde_json::to_value(&credentials)
            .context("Could not serialize ACME account credentials")?;
        Ok((account, Some(value)))
    }

    /// Obtain a certificate for a single domain. Synchronous from the
    /// caller's point of view: returns only once the full bundled chain
    /// is available or the order failed.
    pub async fn issue(&self, account: &Account, domain: &str) -> anyhow::Result<IssuedPem> {
        self.ensure_listeners().await?;

        info!(domain = %domain, "Requesting certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .with_context(|| format!("Could not create ACME order for {}", domain))?;

        // Set up and acknowledge every pending challenge within a single
        // `authorizations()` borrow (it holds `order` mutably for its whole
        // lifetime), then wait for each authorization afterwards, once that
        // borrow has been released and `order` is available again.
        let mut completed = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                if authz.status == AuthorizationStatus::Valid {
                    continue;
                }

                let identifier = match authz.identifier().identifier {
                    Identifier::Dns(d) => d.clone(),
                    _ => anyhow::bail!("Unsupported ACME identifier type for {}", domain),
                };

                let challenge_type = if authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::Http01)
                {
                    ChallengeType::Http01
                } else if authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::TlsAlpn01)
                {
                    ChallengeType::TlsAlpn01
                } else {
                    anyhow::bail!("No supported challenge type offered for {}", identifier)
                };

                let mut challenge = authz.challenge(challenge_type.clone()).ok_or_else(|| {
                    anyhow::anyhow!("No supported challenge type offered for {}", identifier)
                })?;

                let key_auth = challenge.key_authorization();
                let token = challenge.token.clone();

                match challenge_type {
                    ChallengeType::Http01 => {
                        debug!(domain = %identifier, token = %token, "Setting up HTTP-01 challenge");
                        self.http01
                            .set(token.clone(), key_auth.as_str().to_string())
                            .await;
                    }
                    _ => {
                        debug!(domain = %identifier, "Setting up TLS-ALPN-01 challenge");
                        let digest: Vec<u8> = key_auth.digest().as_ref().to_vec();
                        let cert = challenge_cert(&identifier, &digest)?;
                        self.tls_alpn.set(&identifier, cert);
                    }
                }

                challenge.set_ready().await?;
                completed.push((identifier, challenge_type, token));
            }
        }

        for (identifier, challenge_type, token) in completed {
            self.wait_for_authorization(&mut order, &identifier).await?;

            match challenge_type {
                ChallengeType::Http01 => self.http01.remove(&token).await,
                _ => self.tls_alpn.remove(&identifier),
            }
        }

        // Wait for the order to become ready for finalization
        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    anyhow::bail!("ACME order became invalid for {}", domain)
                }
                _ => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("ACME order timed out for {}", domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        // Issued certificates use RSA-2048 keys
        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
            .context("Could not generate certificate key")?;

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
        let csr = params
            .serialize_request(&key_pair)
            .context("Could not serialize CSR")?;
        let csr_der = csr.der();

        order
            .finalize_csr(csr_der)
            .await
            .with_context(|| format!("Could not finalize ACME order for {}", domain))?;

        // Wait for the signed chain
        let mut attempts = 0;
        let certificate_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(chain) = order.certificate().await? {
                        break chain;
                    }
                    anyhow::bail!("ACME order valid but no certificate returned for {}", domain);
                }
                OrderStatus::Invalid => {
                    anyhow::bail!("ACME order became invalid after finalization for {}", domain)
                }
                _ => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Timed out waiting for certificate for {}", domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        };

        info!(domain = %domain, "Certificate obtained");

        Ok(IssuedPem {
            private_key_pem: key_pair.serialize_pem(),
            certificate_pem,
        })
    }

    async fn wait_for_authorization(
        &self,
        order: &mut Order,
        identifier: &str,
    ) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let mut authorizations = order.authorizations();
            let mut status = None;
            while let Some(result) = authorizations.next().await {
                let authz = result?;
                if matches!(authz.identifier().identifier, Identifier::Dns(d) if d == identifier) {
                    status = Some(authz.status);
                    break;
                }
            }

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timed out for {}", identifier);
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", identifier)
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "Authorization status");
                }
                None => anyhow::bail!("Authorization not found for {}", identifier),
            }
        }
    }

    /// Bind the challenge listeners once; later calls are no-ops.
    async fn ensure_listeners(&self) -> anyhow::Result<()> {
        self.listeners
            .get_or_try_init(|| async {
                let http = TcpListener::bind(("0.0.0.0", self.auth_port_http))
                    .await
                    .with_context(|| {
                        format!(
                            "Could not bind HTTP-01 challenge listener on port {}",
                            self.auth_port_http
                        )
                    })?;
                let tls = TcpListener::bind(("0.0.0.0", self.auth_port_https))
                    .await
                    .with_context(|| {
                        format!(
                            "Could not bind TLS-ALPN-01 challenge listener on port {}",
                            self.auth_port_https
                        )
                    })?;

                info!(
                    http_port = self.auth_port_http,
                    tls_port = self.auth_port_https,
                    "ACME challenge listeners bound"
                );

                tokio::spawn(serve_http01(http, self.http01.clone()));
                tokio::spawn(serve_tls_alpn01(tls, Arc::clone(&self.tls_alpn)));
                Ok::<(), anyhow::Error>(())
            })
            .await
            .map(|_| ())
    }
}

/// Answer HTTP-01 validation requests from the pending challenge map
async fn serve_http01(listener: TcpListener, challenges: Http01Challenges) {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "HTTP-01 listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let challenges = challenges.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let challenges = challenges.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        challenge_response(req.uri().path(), &challenges).await,
                    )
                }
            });

            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "HTTP-01 connection error");
            }
        });
    }
}

async fn challenge_response(path: &str, challenges: &Http01Challenges) -> Response<Full<Bytes>> {
    let not_found = || {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .expect("valid response with StatusCode enum")
    };

    let Some(token) = path.strip_prefix(CHALLENGE_PATH_PREFIX) else {
        return not_found();
    };

    match challenges.get(token).await {
        Some(key_authorization) => {
            debug!(token = %token, "Serving HTTP-01 key authorization");
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(key_authorization)))
                .expect("valid response with StatusCode enum and static header")
        }
        None => not_found(),
    }
}

/// Complete TLS-ALPN-01 validation handshakes; presenting the challenge
/// certificate is the whole exchange, the connection carries no data.
async fn serve_tls_alpn01(listener: TcpListener, challenges: Arc<TlsAlpn01Challenges>) {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = match rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
    {
        Ok(builder) => builder,
        Err(e) => {
            error!(error = %e, "Could not configure TLS-ALPN-01 listener");
            return;
        }
    };
    let mut config = builder
        .with_no_client_auth()
        .with_cert_resolver(challenges);
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "TLS-ALPN-01 listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(_) => debug!(peer = %peer, "Served TLS-ALPN-01 handshake"),
                Err(e) => debug!(peer = %peer, error = %e, "TLS-ALPN-01 handshake failed"),
            }
        });
    }
}

/// Build the self-signed challenge certificate carrying the acmeIdentifier
/// extension with the key authorization digest.
fn challenge_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // OCTET STRING of the 32-byte SHA-256 digest
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value));

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Could not serialize challenge key: {}", e))?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Could not create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}
