//! Certificate store: persisted ACME state and the on-disk PEM pool
//!
//! Owns `<config_dir>/state.json` (account identity, registration,
//! per-domain issuance metadata) and `<config_dir>/cert/*.pem` (key +
//! chain bundles the proxy binds with). Issuance goes through the ACME
//! issuer when a domain has no usable certificate; a self-signed RSA
//! fallback covers the proxy's need for at least one certificate on the
//! HTTPS bind.
//!
//! All mutations of the state file and the PEM files are serialized
//! behind one lock, so at most one issuance is in flight and state writes
//! never interleave.

use crate::acme::AcmeIssuer;
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long an ACME-issued certificate is considered to live, and when it
/// is reissued. The 15-day gap leaves room to fix issuance problems by
/// hand before the certificate actually expires.
const CERT_LIFETIME_DAYS: i64 = 90;
const CERT_REISSUE_DAYS: i64 = 75;

const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Capability set the config synthesizer depends on. A test double
/// returning sentinel paths exercises the synthesizer offline.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Path to a PEM bundle for `domain`, issuing or reissuing if needed.
    async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf>;

    /// Path to a self-signed PEM bundle for `domain` (may be empty, for
    /// the proxy's fallback bind).
    async fn self_signed(&self, domain: &str) -> anyhow::Result<PathBuf>;

    /// Internal challenge port the proxy should route ACME traffic to.
    fn auth_service_port(&self, ssl: bool) -> u16;
}

/// Issuance metadata for one domain. The PEM itself lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub issue_date: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
    pub reissue_date: DateTime<Utc>,
}

impl IssuedCertificate {
    /// Metadata for a certificate issued right now.
    fn starting_now() -> Self {
        let now = Utc::now();
        Self {
            issue_date: now,
            expire_date: now + Duration::days(CERT_LIFETIME_DAYS),
            reissue_date: now + Duration::days(CERT_REISSUE_DAYS),
        }
    }
}

/// Shape of `state.json`
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    email: String,
    /// Base64-encoded DER of the store's EC P-256 identity key, generated
    /// once at first boot.
    private_key: String,
    /// Opaque ACME registration resource; absent until the account is
    /// registered with the directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    registration: Option<serde_json::Value>,
    certificates: HashMap<String, IssuedCertificate>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub config_dir: PathBuf,
    pub email: String,
    pub organization: String,
    pub auth_port_http: u16,
    pub auth_port_https: u16,
}

struct StoreState {
    account_key: Vec<u8>,
    registration: Option<serde_json::Value>,
    certificates: HashMap<String, IssuedCertificate>,
}

/// Certificate store backed by `<config_dir>` on disk
pub struct CertificateStore {
    config: StoreConfig,
    issuer: AcmeIssuer,
    state: Mutex<StoreState>,
}

impl CertificateStore {
    /// Open (or initialize) the store. State corruption, an unparseable
    /// key, and an email mismatch against the persisted state are all
    /// fatal: mixing state directories from different accounts must never
    /// go unnoticed.
    pub fn new(config: StoreConfig, issuer: AcmeIssuer) -> anyhow::Result<Self> {
        create_private_dir(&config.config_dir)?;
        create_private_dir(&config.config_dir.join("cert"))?;

        let state = load_or_init_state(&config)?;

        Ok(Self {
            config,
            issuer,
            state: Mutex::new(state),
        })
    }

    fn state_file_path(&self) -> PathBuf {
        self.config.config_dir.join("state.json")
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.config.config_dir.join("cert").join(format!("{}.pem", domain))
    }

    fn self_signed_path(&self, domain: &str) -> PathBuf {
        self.config
            .config_dir
            .join("cert")
            .join(format!("selfsigned-{}.pem", domain))
    }

    fn save_state(&self, state: &StoreState) -> anyhow::Result<()> {
        let persisted = PersistedState {
            email: self.config.email.clone(),
            private_key: BASE64.encode(&state.account_key),
            registration: state.registration.clone(),
            certificates: state.certificates.clone(),
        };
        let data = serde_json::to_vec(&persisted).context("Could not marshal state")?;
        write_private_file(&self.state_file_path(), &data)
            .with_context(|| format!("Could not write {}", self.state_file_path().display()))?;
        Ok(())
    }

    /// Domains whose reissue timestamp has passed.
    pub async fn domains_to_reissue(&self) -> Vec<String> {
        let now = Utc::now();
        let state = self.state.lock().await;
        state
            .certificates
            .iter()
            .filter(|(_, cert)| now > cert.reissue_date)
            .map(|(domain, _)| domain.clone())
            .collect()
    }

    async fn certificate_for_domain_impl(&self, domain: &str) -> anyhow::Result<PathBuf> {
        let cert_path = self.cert_path(domain);
        let mut state = self.state.lock().await;

        let mut valid = true;
        if !cert_path.exists() {
            warn!(domain = %domain, "Certificate file is missing, going to issue");
            valid = false;
        } else {
            match state.certificates.get(domain) {
                Some(cert) if Utc::now() > cert.reissue_date => {
                    warn!(domain = %domain, "Certificate reached reissue timestamp, reissuing now");
                    valid = false;
                }
                Some(_) => {}
                None => {
                    warn!(domain = %domain, "Certificate metadata is missing, going to issue");
                    valid = false;
                }
            }
        }

        if valid {
            return Ok(cert_path);
        }

        let (account, new_registration) = self
            .issuer
            .account(state.registration.as_ref())
            .await
            .context("Could not prepare ACME account")?;
        if let Some(registration) = new_registration {
            state.registration = Some(registration);
            self.save_state(&state)
                .context("Could not persist ACME registration")?;
        }

        let issued = self
            .issuer
            .issue(&account, domain)
            .await
            .with_context(|| format!("Could not issue certificate for {}", domain))?;

        let mut bundle = Vec::new();
        bundle.extend_from_slice(issued.private_key_pem.as_bytes());
        bundle.extend_from_slice(issued.certificate_pem.as_bytes());
        write_private_file(&cert_path, &bundle)
            .with_context(|| format!("Could not write certificate for {}", domain))?;

        state
            .certificates
            .insert(domain.to_string(), IssuedCertificate::starting_now());
        self.save_state(&state)
            .with_context(|| format!("Could not save state after issuing {}", domain))?;

        info!(domain = %domain, path = %cert_path.display(), "Certificate issued and stored");
        Ok(cert_path)
    }

    async fn self_signed_impl(&self, domain: &str) -> anyhow::Result<PathBuf> {
        let cert_path = self.self_signed_path(domain);
        let _state = self.state.lock().await;

        if cert_path.exists() {
            return Ok(cert_path);
        }

        debug!(domain = %domain, "Generating self-signed certificate");
        let pem = generate_self_signed_pem(domain, &self.config.organization)?;
        write_private_file(&cert_path, pem.as_bytes())
            .with_context(|| format!("Could not write {}", cert_path.display()))?;

        info!(domain = %domain, path = %cert_path.display(), "Self-signed certificate created");
        Ok(cert_path)
    }
}

#[async_trait]
impl CertificateProvider for CertificateStore {
    async fn certificate_for_domain(&self, domain: &str) -> anyhow::Result<PathBuf> {
        self.certificate_for_domain_impl(domain).await
    }

    async fn self_signed(&self, domain: &str) -> anyhow::Result<PathBuf> {
        self.self_signed_impl(domain).await
    }

    fn auth_service_port(&self, ssl: bool) -> u16 {
        if ssl {
            self.config.auth_port_https
        } else {
            self.config.auth_port_http
        }
    }
}

fn load_or_init_state(config: &StoreConfig) -> anyhow::Result<StoreState> {
    let state_path = config.config_dir.join("state.json");

    if !state_path.exists() {
        warn!(path = %state_path.display(), "State file is missing, assuming new installation");
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .context("Could not generate account key")?;
        let state = StoreState {
            account_key: key.serialize_der(),
            registration: None,
            certificates: HashMap::new(),
        };

        let persisted = PersistedState {
            email: config.email.clone(),
            private_key: BASE64.encode(&state.account_key),
            registration: None,
            certificates: HashMap::new(),
        };
        let data = serde_json::to_vec(&persisted).context("Could not marshal state")?;
        write_private_file(&state_path, &data)
            .with_context(|| format!("Could not write {}", state_path.display()))?;

        return Ok(state);
    }

    let data = std::fs::read(&state_path)
        .with_context(|| format!("Could not read state file {}", state_path.display()))?;
    let persisted: PersistedState =
        serde_json::from_slice(&data).context("Could not parse state file")?;

    if persisted.email != config.email {
        anyhow::bail!(
            "The persisted email ({}) is different than the one given ({})",
            persisted.email,
            config.email
        );
    }

    let account_key = BASE64
        .decode(&persisted.private_key)
        .context("Could not decode account key")?;
    KeyPair::try_from(account_key.as_slice()).context("Could not parse account key")?;

    let known: Vec<&String> = persisted.certificates.keys().collect();
    info!(
        path = %state_path.display(),
        certificates = ?known,
        "Recovered state"
    );

    Ok(StoreState {
        account_key,
        registration: persisted.registration,
        certificates: persisted.certificates,
    })
}

/// Self-signed RSA-2048 bundle: one PEM file holding the certificate
/// followed by the PKCS#8 private key.
fn generate_self_signed_pem(domain: &str, organization: &str) -> anyhow::Result<String> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
        .context("Could not generate self-signed key")?;

    let sans = if domain.is_empty() {
        Vec::new()
    } else {
        vec![domain.to_string()]
    };
    let mut params = CertificateParams::new(sans)?;

    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, organization.to_string());
    if !domain.is_empty() {
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
    }

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(SELF_SIGNED_VALIDITY_DAYS);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params
        .self_signed(&key_pair)
        .context("Could not create self-signed certificate")?;

    Ok(format!("{}{}", cert.pem(), key_pair.serialize_pem()))
}

fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Could not create directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Could not set permissions on {}", path.display()))?;
    }
    Ok(())
}

fn write_private_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
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
        file.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)?;
    }
    Ok(())
}
