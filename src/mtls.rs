//! Client-side mTLS material the control plane presents to nodes.

use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::warn;
use zeroize::Zeroizing;

use crate::pki::{self, CertificateAuthority, PkiError};
use crate::store::NodeId;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    #[error("certificate parsing error: {0}")]
    CertificateParse(String),

    #[error("key parsing error: {0}")]
    KeyParse(String),

    #[error("certificate has expired: {0}")]
    Expired(String),

    #[error("failed to obtain client identity: {0}")]
    Pki(#[from] PkiError),
}

/// The panel client certificate plus the CA used to verify nodes.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: String,
    key_pem: Zeroizing<String>,
    pub ca_pem: String,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("key_pem", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    /// Build from PEM material, rejecting anything malformed or expired.
    pub fn new(
        cert_pem: String,
        key_pem: Zeroizing<String>,
        ca_pem: String,
    ) -> Result<Self, MtlsError> {
        let report = pki::validate_certificate(&cert_pem)
            .map_err(|e| MtlsError::CertificateParse(format!("client certificate: {}", e)))?;
        if report.is_expired {
            return Err(MtlsError::Expired(report.subject));
        }
        pki::validate_certificate(&ca_pem)
            .map_err(|e| MtlsError::CertificateParse(format!("CA certificate: {}", e)))?;

        let key = ::pem::parse(key_pem.as_bytes())
            .map_err(|e| MtlsError::KeyParse(e.to_string()))?;
        if !key.tag().ends_with("PRIVATE KEY") {
            return Err(MtlsError::KeyParse(format!(
                "expected a private key, found {}",
                key.tag()
            )));
        }

        Ok(Self {
            cert_pem,
            key_pem,
            ca_pem,
        })
    }

    /// Load (or create) the panel client certificate from the CA.
    ///
    /// An expired cached certificate is not replaced here; the error names
    /// the files and the renewal command.
    pub fn from_authority(ca: &CertificateAuthority) -> Result<Self, MtlsError> {
        let issued = ca.issue_panel_client_certificate()?;
        let ca_pem = ca.ca_bundle()?;
        Self::new(issued.cert_pem, issued.key_pem, ca_pem).map_err(|e| match e {
            MtlsError::Expired(subject) => {
                let cert = ca.ssl_dir().join(pki::CLIENT_CERT_FILE);
                let key = ca.ssl_dir().join(pki::CLIENT_KEY_FILE);
                warn!(cert = %cert.display(), key = %key.display(), "Panel client certificate expired");
                MtlsError::Expired(format!(
                    "{}; run `tether cert panel-client --renew` or remove {} and {}",
                    subject,
                    cert.display(),
                    key.display()
                ))
            }
            other => other,
        })
    }

    /// TLS settings for dialing one node. The node must present a
    /// certificate carrying its synthetic name.
    pub fn tls_config_for(&self, node_id: NodeId) -> ClientTlsConfig {
        let identity = Identity::from_pem(&self.cert_pem, self.key_pem.as_bytes());
        ClientTlsConfig::new()
            .identity(identity)
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
            .domain_name(pki::node_dns_name(node_id))
    }
}
