//! Certificate authority and leaf issuance for node mutual TLS.
//!
//! The control plane owns one self-signed root. Every node gets a leaf that
//! is valid for both server and client auth; the control plane itself uses a
//! client-auth-only leaf when it dials nodes.
//!
//! # Files
//!
//! Everything lives under the `ssl` directory handed to
//! [`CertificateAuthority::new`]:
//!
//! - `ca.cert` (0644), `ca.key` (0600)
//! - `client.cert` (0644), `client.key` (0600)
//!
//! Node private keys are never written here. They are handed to the
//! [`NodeStore`] and dropped.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity};
use crate::store::{NodeCertificateRecord, NodeId, NodeStore, StorageError};

/// CA validity (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Node and panel-client validity (1 year)
pub const LEAF_VALIDITY_DAYS: i64 = 365;

pub const ORGANIZATION: &str = "Tether";
pub const CA_COMMON_NAME: &str = "Tether CA";
pub const CA_DNS_NAME: &str = "tether-ca";
pub const PANEL_CLIENT_NAME: &str = "tether-panel";
pub const PANEL_CLIENT_SUBJECT: &str = "panel-client";

pub const CA_CERT_FILE: &str = "ca.cert";
pub const CA_KEY_FILE: &str = "ca.key";
pub const CLIENT_CERT_FILE: &str = "client.cert";
pub const CLIENT_KEY_FILE: &str = "client.key";

const SERIAL_LEN: usize = 16;

/// Synthetic DNS name every node certificate carries and the control plane
/// verifies when dialing that node.
const SECS_PER_DAY: i64 = 86_400;

pub fn node_dns_name(node_id: NodeId) -> String {
    format!("tether-node-{}", node_id)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// The deployment's root identity.
#[derive(Clone)]
pub struct CaIdentity {
    pub cert_pem: String,
    key_pem: Zeroizing<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaIdentity")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

impl CaIdentity {
    fn from_pem(cert_pem: String, key_pem: Zeroizing<String>) -> Result<Self> {
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;
        if certificate_public_key(&cert_pem)? != key_pair.der_bytes() {
            return Err(PkiError::Parse(
                "CA key does not match CA certificate".to_string(),
            ));
        }
        let report = validate_certificate(&cert_pem)?;
        Ok(Self {
            cert_pem,
            key_pem,
            not_before: report.not_before,
            not_after: report.not_after,
        })
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))
    }
}

/// A leaf certificate together with its private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Node id or `panel-client`
    pub subject: String,
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub subject_alt_names: Vec<String>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("subject", &self.subject)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("subject_alt_names", &self.subject_alt_names)
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Result of inspecting a PEM certificate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateReport {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
    pub is_expired: bool,
    pub days_until_expiry: i64,
    pub subject_alt_names: Vec<String>,
}

/// Raw subjectPublicKey bits of a PEM certificate.
fn certificate_public_key(cert_pem: &str) -> Result<Vec<u8>> {
    let pem = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Inspect a certificate against the current time.
pub fn validate_certificate(cert_pem: &str) -> Result<CertificateReport> {
    validate_certificate_at(cert_pem, Utc::now())
}

/// Inspect a certificate as of `now`. Expiry is reported, never an error.
pub fn validate_certificate_at(cert_pem: &str, now: DateTime<Utc>) -> Result<CertificateReport> {
    let pem = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;

    let not_before = timestamp(cert.validity().not_before.timestamp())?;
    let not_after = timestamp(cert.validity().not_after.timestamp())?;

    let mut subject_alt_names = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => subject_alt_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        subject_alt_names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateReport {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        serial: cert.raw_serial_as_string(),
        is_expired: now > not_after,
        days_until_expiry: (not_after - now).num_seconds().div_euclid(SECS_PER_DAY),
        subject_alt_names,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::Parse(format!("timestamp out of range: {}", secs)))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Owns the root key pair and every file under the ssl directory.
pub struct CertificateAuthority {
    ssl_dir: PathBuf,
    events: Arc<dyn SecurityEventSink>,
    ca: Mutex<Option<Arc<CaIdentity>>>,
    panel_client: Mutex<()>,
}

impl CertificateAuthority {
    pub fn new(ssl_dir: impl Into<PathBuf>, events: Arc<dyn SecurityEventSink>) -> Self {
        Self {
            ssl_dir: ssl_dir.into(),
            events,
            ca: Mutex::new(None),
            panel_client: Mutex::new(()),
        }
    }

    pub fn ssl_dir(&self) -> &Path {
        &self.ssl_dir
    }

    /// Load the persisted CA, creating it on first use.
    ///
    /// Concurrent callers observe the same identity. With `force_regenerate`
    /// a new root replaces the old one and the cached panel client
    /// certificate is discarded, since it no longer chains.
    pub fn get_or_create_ca(&self, force_regenerate: bool) -> Result<Arc<CaIdentity>> {
        let mut slot = self.ca.lock();

        if !force_regenerate {
            if let Some(ca) = slot.as_ref() {
                return Ok(ca.clone());
            }

            let cert_path = self.ssl_dir.join(CA_CERT_FILE);
            let key_path = self.ssl_dir.join(CA_KEY_FILE);
            if cert_path.exists() && key_path.exists() {
                let cert_pem = fs::read_to_string(&cert_path)?;
                let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
                let ca = Arc::new(CaIdentity::from_pem(cert_pem, key_pem)?);
                info!(path = %cert_path.display(), not_after = %ca.not_after, "Loaded CA");
                *slot = Some(ca.clone());
                return Ok(ca);
            }
        }

        let ca = Arc::new(generate_ca()?);
        // Key before cert: a cert on disk implies its key is there too.
        write_pem(&self.ssl_dir.join(CA_KEY_FILE), &ca.key_pem, 0o600)?;
        write_pem(&self.ssl_dir.join(CA_CERT_FILE), &ca.cert_pem, 0o644)?;

        if force_regenerate {
            for file in [CLIENT_CERT_FILE, CLIENT_KEY_FILE] {
                match fs::remove_file(self.ssl_dir.join(file)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        info!(
            ssl_dir = %self.ssl_dir.display(),
            not_after = %ca.not_after,
            regenerated = force_regenerate,
            "Created CA"
        );
        self.events.emit(SecurityEvent::new(
            SecurityEventKind::CertificateIssued,
            Severity::Info,
            format!("CA created, valid until {}", ca.not_after),
        ));

        *slot = Some(ca.clone());
        Ok(ca)
    }

    /// The CA for signing. Any failure to load or create it is an
    /// issuance failure.
    fn issuing_ca(&self) -> Result<Arc<CaIdentity>> {
        self.get_or_create_ca(false).map_err(|e| match e {
            PkiError::Issuance(_) => e,
            other => PkiError::Issuance(format!("CA unavailable: {}", other)),
        })
    }

    /// The CA's public certificate. Never includes the private key.
    pub fn ca_bundle(&self) -> Result<String> {
        Ok(self.get_or_create_ca(false)?.cert_pem.clone())
    }

    /// Issue a node leaf. An unparsable `ip` is skipped with a warning.
    pub fn issue_node_certificate(
        &self,
        node_id: NodeId,
        hostname: &str,
        ip: Option<&str>,
    ) -> Result<IssuedCertificate> {
        let ca = self.issuing_ca()?;

        let synthetic = node_dns_name(node_id);
        let mut sans = vec![
            san(hostname)?,
            san(&synthetic)?,
            san("localhost")?,
        ];
        if let Some(raw) = ip {
            match raw.parse::<IpAddr>() {
                Ok(addr) => sans.push(SanType::IpAddress(addr)),
                Err(e) => warn!(node_id, ip = raw, error = %e, "Invalid IP address, omitting IP SAN"),
            }
        }

        let issued = issue_leaf(
            &ca,
            &synthetic,
            sans,
            vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            node_id.to_string(),
        )?;

        info!(node_id, hostname, expires_at = %issued.expires_at, "Issued node certificate");
        self.events.emit(
            SecurityEvent::new(
                SecurityEventKind::CertificateIssued,
                Severity::Info,
                format!("node certificate for {}", hostname),
            )
            .for_node(node_id),
        );
        Ok(issued)
    }

    /// Issue a node leaf and hand it to the store. No copy of the private
    /// key stays behind.
    pub async fn provision_node_certificate(
        &self,
        store: &dyn NodeStore,
        node_id: NodeId,
        hostname: &str,
        ip: Option<&str>,
    ) -> Result<CertificateReport> {
        let issued = self.issue_node_certificate(node_id, hostname, ip)?;
        let report = validate_certificate(&issued.cert_pem)?;
        store
            .store_node_certificate(NodeCertificateRecord {
                node_id,
                cert_pem: issued.cert_pem,
                key_pem: issued.key_pem,
                issued_at: issued.issued_at,
                expires_at: issued.expires_at,
            })
            .await?;
        Ok(report)
    }

    /// The control plane's outbound client identity, cached on disk.
    pub fn issue_panel_client_certificate(&self) -> Result<IssuedCertificate> {
        self.panel_client_certificate(false)
    }

    /// Discard the cached panel client certificate and issue a new one.
    pub fn renew_panel_client_certificate(&self) -> Result<IssuedCertificate> {
        self.panel_client_certificate(true)
    }

    fn panel_client_certificate(&self, renew: bool) -> Result<IssuedCertificate> {
        let _guard = self.panel_client.lock();
        let ca = self.issuing_ca()?;

        let cert_path = self.ssl_dir.join(CLIENT_CERT_FILE);
        let key_path = self.ssl_dir.join(CLIENT_KEY_FILE);
        if !renew && cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
            let report = validate_certificate(&cert_pem)?;
            return Ok(IssuedCertificate {
                subject: PANEL_CLIENT_SUBJECT.to_string(),
                cert_pem,
                key_pem,
                issued_at: report.not_before,
                expires_at: report.not_after,
                subject_alt_names: report.subject_alt_names,
            });
        }

        let issued = issue_leaf(
            &ca,
            PANEL_CLIENT_NAME,
            vec![san(PANEL_CLIENT_NAME)?, san("localhost")?],
            vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            vec![ExtendedKeyUsagePurpose::ClientAuth],
            PANEL_CLIENT_SUBJECT.to_string(),
        )?;
        write_pem(&cert_path, &issued.cert_pem, 0o644)?;
        write_pem(&key_path, &issued.key_pem, 0o600)?;

        info!(path = %cert_path.display(), expires_at = %issued.expires_at, "Issued panel client certificate");
        self.events.emit(SecurityEvent::new(
            SecurityEventKind::CertificateIssued,
            Severity::Info,
            "panel client certificate",
        ));
        Ok(issued)
    }

    /// Inspect a certificate, reporting malformed or expired input to the
    /// event sink.
    pub fn validate(&self, cert_pem: &str) -> Result<CertificateReport> {
        match validate_certificate(cert_pem) {
            Ok(report) => {
                if report.is_expired {
                    self.events.emit(SecurityEvent::new(
                        SecurityEventKind::CertificateInvalid,
                        Severity::Warning,
                        format!("certificate {} expired at {}", report.subject, report.not_after),
                    ));
                }
                Ok(report)
            }
            Err(e) => {
                self.events.emit(SecurityEvent::new(
                    SecurityEventKind::CertificateInvalid,
                    Severity::Warning,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }
}

fn generate_ca() -> Result<CaIdentity> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(CA_COMMON_NAME);
    params.subject_alt_names = vec![san(CA_DNS_NAME)?];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial());

    let issued_at = Utc::now();
    let expires_at = issued_at + Duration::days(CA_VALIDITY_DAYS);
    params.not_before = offset(issued_at)?;
    params.not_after = offset(expires_at)?;

    let key_pair = generate_key("CA")?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| PkiError::Issuance(format!("failed to create CA cert: {}", e)))?;

    Ok(CaIdentity {
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
        not_before: issued_at,
        not_after: expires_at,
    })
}

fn issue_leaf(
    ca: &CaIdentity,
    common_name: &str,
    sans: Vec<SanType>,
    key_usages: Vec<KeyUsagePurpose>,
    extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    subject: String,
) -> Result<IssuedCertificate> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = key_usages;
    params.extended_key_usages = extended_key_usages;
    params.serial_number = Some(random_serial());

    let subject_alt_names = sans.iter().map(describe_san).collect();
    params.subject_alt_names = sans;

    let issued_at = Utc::now();
    let expires_at = issued_at + Duration::days(LEAF_VALIDITY_DAYS);
    params.not_before = offset(issued_at)?;
    params.not_after = offset(expires_at)?;

    let leaf_key = generate_key(common_name)?;
    let ca_key = ca.key_pair()?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
        .map_err(|e| PkiError::Issuance(format!("failed to load CA as issuer: {}", e)))?;
    let cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| PkiError::Issuance(format!("failed to sign {}: {}", common_name, e)))?;

    Ok(IssuedCertificate {
        subject,
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        issued_at,
        expires_at,
        subject_alt_names,
    })
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn generate_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate {} key: {}", what, e)))
}

/// 128-bit serial from the OS-seeded CSPRNG, kept positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    rand::rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

fn san(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| PkiError::Issuance(format!("invalid DNS name '{}': {}", name, e)))
}

fn describe_san(san: &SanType) -> String {
    match san {
        SanType::DnsName(name) => name.as_str().to_string(),
        SanType::IpAddress(ip) => ip.to_string(),
        other => format!("{:?}", other),
    }
}

fn offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| PkiError::Issuance(format!("invalid validity bound {}: {}", at, e)))
}

/// Write through a temp file and rename, so readers never see a partial PEM.
fn write_pem(path: &Path, contents: &str, mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        use io::Write;
        let mut file = create_with_mode(&tmp_path, mode)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    set_mode(&tmp_path, mode)?;
    fs::rename(&tmp_path, path)
}

#[cfg(unix)]
fn create_with_mode(path: &Path, mode: u32) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn create_with_mode(path: &Path, _mode: u32) -> io::Result<fs::File> {
    fs::File::create(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Write a PEM file with the given unix mode. Used by the CLI to export
/// node material.
pub fn export_pem(path: &Path, contents: &str, mode: u32) -> io::Result<()> {
    write_pem(path, contents, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::store::MemoryStore;

    fn authority(dir: &Path) -> (CertificateAuthority, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (CertificateAuthority::new(dir, sink.clone()), sink)
    }

    fn parse(pem_str: &str) -> Vec<u8> {
        ::pem::parse(pem_str.as_bytes()).unwrap().contents().to_vec()
    }

    #[test]
    fn ca_is_created_once_and_reloaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = authority(dir.path());
        let created = first.get_or_create_ca(false).unwrap();
        let again = first.get_or_create_ca(false).unwrap();
        assert_eq!(created.cert_pem, again.cert_pem);

        let (second, sink) = authority(dir.path());
        let loaded = second.get_or_create_ca(false).unwrap();
        assert_eq!(created.cert_pem, loaded.cert_pem);
        assert_eq!(sink.count(SecurityEventKind::CertificateIssued), 0);
    }

    #[test]
    fn concurrent_callers_observe_the_same_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let ca = Arc::new(ca);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ca = ca.clone();
                std::thread::spawn(move || ca.get_or_create_ca(false).unwrap().cert_pem.clone())
            })
            .collect();
        let pems: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pems.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn force_regenerate_replaces_ca_and_drops_panel_client() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let original = ca.get_or_create_ca(false).unwrap();
        ca.issue_panel_client_certificate().unwrap();
        assert!(dir.path().join(CLIENT_CERT_FILE).exists());

        let replaced = ca.get_or_create_ca(true).unwrap();
        assert_ne!(original.cert_pem, replaced.cert_pem);
        assert!(!dir.path().join(CLIENT_CERT_FILE).exists());
        assert!(!dir.path().join(CLIENT_KEY_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn ca_files_have_restricted_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        ca.get_or_create_ca(false).unwrap();

        let mode = |file: &str| {
            fs::metadata(dir.path().join(file)).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode(CA_KEY_FILE), 0o600);
        assert_eq!(mode(CA_CERT_FILE), 0o644);
    }

    #[test]
    fn ca_certificate_signs_certificates_only() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let identity = ca.get_or_create_ca(false).unwrap();

        let der = parse(&identity.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(constraints.value.ca);
        let usage = cert.key_usage().unwrap().unwrap();
        assert!(usage.value.key_cert_sign());
        assert!(usage.value.crl_sign());
        assert!(!usage.value.digital_signature());

        let report = validate_certificate(&identity.cert_pem).unwrap();
        assert!(report.subject.contains(CA_COMMON_NAME));
        assert!(report.subject_alt_names.contains(&CA_DNS_NAME.to_string()));
        assert!(report.days_until_expiry >= CA_VALIDITY_DAYS - 1);
    }

    #[test]
    fn node_certificate_chains_to_ca_and_expires_after_a_year() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, sink) = authority(dir.path());
        let ca_report = validate_certificate(&ca.ca_bundle().unwrap()).unwrap();

        let issued = ca
            .issue_node_certificate(7, "node7.example.com", Some("10.0.0.7"))
            .unwrap();
        assert_eq!(issued.subject, "7");

        let now = Utc::now();
        let report = validate_certificate_at(&issued.cert_pem, now).unwrap();
        assert_eq!(report.issuer, ca_report.subject);
        assert!(!report.is_expired);

        let later = validate_certificate_at(&issued.cert_pem, now + Duration::days(366)).unwrap();
        assert!(later.is_expired);
        assert!(later.days_until_expiry < 0);

        for expected in ["node7.example.com", "tether-node-7", "localhost", "10.0.0.7"] {
            assert!(
                report.subject_alt_names.contains(&expected.to_string()),
                "missing SAN {}",
                expected
            );
        }
        assert_eq!(sink.count(SecurityEventKind::CertificateIssued), 2);
    }

    #[test]
    fn node_certificate_is_for_server_and_client_auth() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let issued = ca.issue_node_certificate(3, "node3", None).unwrap();

        let der = parse(&issued.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);
        let usage = cert.key_usage().unwrap().unwrap();
        assert!(usage.value.digital_signature());
        assert!(usage.value.key_encipherment());
    }

    #[test]
    fn invalid_ip_is_omitted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let issued = ca
            .issue_node_certificate(4, "node4", Some("not-an-ip"))
            .unwrap();
        assert_eq!(
            issued.subject_alt_names,
            vec!["node4".to_string(), "tether-node-4".to_string(), "localhost".to_string()]
        );
    }

    #[test]
    fn serials_differ_between_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let a = ca.issue_node_certificate(1, "a", None).unwrap();
        let b = ca.issue_node_certificate(1, "a", None).unwrap();
        assert_ne!(
            validate_certificate(&a.cert_pem).unwrap().serial,
            validate_certificate(&b.cert_pem).unwrap().serial
        );
    }

    #[test]
    fn panel_client_certificate_is_cached_until_files_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());

        let first = ca.issue_panel_client_certificate().unwrap();
        let second = ca.issue_panel_client_certificate().unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);

        fs::remove_file(dir.path().join(CLIENT_KEY_FILE)).unwrap();
        let third = ca.issue_panel_client_certificate().unwrap();
        assert_ne!(first.cert_pem, third.cert_pem);

        let der = parse(&third.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);
        assert_eq!(
            third.subject_alt_names,
            vec![PANEL_CLIENT_NAME.to_string(), "localhost".to_string()]
        );
    }

    #[test]
    fn corrupt_ca_key_fails_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = authority(dir.path());
        first.get_or_create_ca(false).unwrap();
        fs::write(dir.path().join(CA_KEY_FILE), "garbage").unwrap();

        let (ca, _) = authority(dir.path());
        let err = ca.issue_node_certificate(1, "node1", None).unwrap_err();
        assert!(matches!(err, PkiError::Issuance(_)), "got {:?}", err);
        let err = ca.issue_panel_client_certificate().unwrap_err();
        assert!(matches!(err, PkiError::Issuance(_)), "got {:?}", err);
    }

    #[test]
    fn mismatched_ca_key_is_refused_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        ca.get_or_create_ca(false).unwrap();
        let stray = generate_ca().unwrap();
        fs::write(dir.path().join(CA_KEY_FILE), stray.key_pem.as_str()).unwrap();

        let (reloaded, _) = authority(dir.path());
        let err = reloaded.get_or_create_ca(false).unwrap_err();
        match err {
            PkiError::Parse(msg) => assert!(msg.contains("does not match")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn days_until_expiry_rounds_down() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let issued = ca.issue_node_certificate(5, "node5", None).unwrap();
        let report = validate_certificate(&issued.cert_pem).unwrap();

        let just_after =
            validate_certificate_at(&issued.cert_pem, report.not_after + Duration::hours(3))
                .unwrap();
        assert!(just_after.is_expired);
        assert_eq!(just_after.days_until_expiry, -1);

        let just_before =
            validate_certificate_at(&issued.cert_pem, report.not_after - Duration::hours(3))
                .unwrap();
        assert!(!just_before.is_expired);
        assert_eq!(just_before.days_until_expiry, 0);
    }

    #[test]
    fn renew_replaces_cached_panel_client() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let first = ca.issue_panel_client_certificate().unwrap();
        let renewed = ca.renew_panel_client_certificate().unwrap();
        assert_ne!(first.cert_pem, renewed.cert_pem);

        let cached = ca.issue_panel_client_certificate().unwrap();
        assert_eq!(cached.cert_pem, renewed.cert_pem);
    }

    #[test]
    fn malformed_pem_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, sink) = authority(dir.path());
        let err = ca.validate("not a certificate").unwrap_err();
        assert!(matches!(err, PkiError::Parse(_)));
        assert_eq!(sink.count(SecurityEventKind::CertificateInvalid), 1);
    }

    #[test]
    fn ca_bundle_never_contains_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let bundle = ca.ca_bundle().unwrap();
        assert!(bundle.contains("BEGIN CERTIFICATE"));
        assert!(!bundle.contains("PRIVATE KEY"));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let issued = ca.issue_node_certificate(2, "node2", None).unwrap();
        let debug = format!("{:?}", issued);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn provisioned_node_certificate_lands_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, _) = authority(dir.path());
        let store = MemoryStore::new();

        let report = ca
            .provision_node_certificate(&store, 9, "node9.example.com", None)
            .await
            .unwrap();
        assert!(report.subject.contains("tether-node-9"));
        assert!(store.has_certificate(9));
        assert!(!dir.path().join("node-9.key").exists());
    }
}
