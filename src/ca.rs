use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, Issuer, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

/// Default validity window for a freshly bootstrapped root CA (SPEC_FULL
/// §4.3's `new_authority(organization, commonName, validity)`), used when
/// `RootAuthority::load_or_generate` has no persisted CA to reload.
const DEFAULT_ROOT_VALIDITY: Duration = Duration::days(365 * 10);

/// Default validity window for a minted leaf certificate (SPEC_FULL §4.3
/// step 2: `NotAfter = NotBefore + validity`, 1 year by default).
const LEAF_VALIDITY: Duration = Duration::days(365);

/// How far back to backdate `NotBefore` on both root and leaf certificates,
/// to tolerate mild clock skew between the proxy host and whatever verifies
/// the certificate (SPEC_FULL §4.3 step 2).
const CLOCK_SKEW_TOLERANCE: Duration = Duration::hours(1);

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    InvalidAuthority(String),
}

impl Error for CaError {}

impl fmt::Display for CaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

/// The long-lived signing identity. Holds the CA certificate and its key for
/// the lifetime of the process.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
}

impl fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootAuthority").finish_non_exhaustive()
    }
}

struct CaFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaFiles {
    fn new(home: &Path) -> Self {
        CaFiles {
            cert_path: home.join("ca_cert.pem"),
            key_path: home.join("ca_key.pem"),
        }
    }
}

impl RootAuthority {
    /// Loads the CA from `dir` if both files already exist, otherwise generates
    /// a fresh self-signed root and persists it there.
    pub fn load_or_generate(dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(dir)?;
        let files = CaFiles::new(dir);

        if files.cert_path.exists() && files.key_path.exists() {
            debug!("loading existing root CA from {}", dir.display());
            let key_pem = fs::read_to_string(&files.key_path)?;
            let cert_pem = fs::read_to_string(&files.cert_path)?;
            let key_pair = KeyPair::from_pem(&key_pem)?;

            // Re-derive the DER form from the same cert+key pair rather than
            // hand-parsing the PEM body; `self_signed` on the original
            // params reproduces the certificate we persisted.
            let reloaded = CertificateParams::from_ca_cert_pem(&cert_pem)?
                .self_signed(&key_pair)?;
            let cert_der = reloaded.der().clone();

            let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
            return Ok(RootAuthority { issuer, cert_der });
        }

        debug!("generating fresh root CA in {}", dir.display());
        let (ca_cert, key_pair) =
            Self::new_authority("betproxy", "betproxy root CA", DEFAULT_ROOT_VALIDITY)?;

        let cert_pem = ca_cert.pem();
        let key_pem = key_pair.serialize_pem();
        fs::write(&files.cert_path, &cert_pem)?;
        write_private_key(&files.key_path, &key_pem)?;

        let cert_der = ca_cert.der().clone();
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        Ok(RootAuthority { issuer, cert_der })
    }

    /// Synthesizes a fresh self-signed CA certificate and key pair for
    /// first-run bootstrap (SPEC_FULL §4.3's `new_authority`). Does not
    /// touch disk or any existing [`RootAuthority`]; `load_or_generate` is
    /// what persists the result and wraps it into a usable authority.
    pub fn new_authority(
        organization: &str,
        common_name: &str,
        validity: Duration,
    ) -> Result<(Certificate, KeyPair), CaError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        params.key_usages.push(KeyUsagePurpose::CrlSign);

        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before.saturating_add(validity);

        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    /// The CA certificate in DER form, for handing to clients that need to
    /// trust it (tests, `--print-ca` style tooling).
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);
    use std::io::Write;
    let mut f = opts.open(path)?;
    f.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    fs::write(path, pem)
}

/// A minted leaf certificate plus the server-side TLS configuration built from it.
#[derive(Clone)]
pub struct LeafEntry {
    pub server_config: Arc<ServerConfig>,
}

/// Caches one [`LeafEntry`] per distinct host, minting lazily and at most once
/// per host regardless of concurrent demand.
pub struct ImpersonationCache {
    authority: RootAuthority,
    leaf_key: KeyPair,
    entries: DashMap<String, LeafEntry>,
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl ImpersonationCache {
    pub fn new(authority: RootAuthority) -> Result<Self, CaError> {
        let leaf_key = KeyPair::generate()?;
        Ok(ImpersonationCache {
            authority,
            leaf_key,
            entries: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    pub fn authority(&self) -> &RootAuthority {
        &self.authority
    }

    /// Returns the cached server TLS config for `host`, minting and caching one
    /// if this is the first time `host` has been seen. Normalizes `host`
    /// (lowercase, trailing dot trimmed) before lookup.
    pub async fn tls_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let key = normalize_host(host);

        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.server_config.clone());
        }

        let guard = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _lock = guard.lock().await;

        // Another task may have published the entry while we waited for the lock.
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.server_config.clone());
        }

        trace!("minting leaf certificate for {key}");
        let entry = self.mint_leaf(&key)?;
        self.entries.insert(key.clone(), entry.clone());
        self.inflight.remove(&key);
        Ok(entry.server_config)
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafEntry, CaError> {
        let san = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            SanType::DnsName(host.try_into().map_err(|_| {
                CaError::InvalidAuthority(format!("{host} is not a valid DNS name"))
            })?)
        };

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc() - CLOCK_SKEW_TOLERANCE;
        params.not_before = not_before;
        params.not_after = not_before.saturating_add(LEAF_VALIDITY);

        let leaf = params.signed_by(&self.leaf_key, &self.authority.issuer)?;
        let key_der = PrivateKeyDer::try_from(self.leaf_key.serialize_der())
            .map_err(|_| CaError::InvalidAuthority("leaf key is not a valid PKCS#8 key".into()))?;

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key_der)
            .map_err(|e| CaError::InvalidAuthority(e.to_string()))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafEntry {
            server_config: Arc::new(server_config),
        })
    }
}

/// Lowercases and strips a trailing dot and any port suffix from a `Host`
/// header or `CONNECT` authority, so `Example.com:443.` and `example.com` map
/// to the same cache entry.
pub fn normalize_host(host: &str) -> String {
    let host = host.strip_suffix('.').unwrap_or(host);
    let without_port = if host.starts_with('[') {
        // IPv6 literal, e.g. "[::1]:443" -- keep the brackets, strip the port.
        match host.rfind("]:") {
            Some(idx) => &host[..idx + 1],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
            _ => host,
        }
    };
    without_port.to_ascii_lowercase()
}
