//! TLS client configuration built from [`VerifyConfig`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

/// Client certificate and key, both PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Server certificate verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerifyConfig {
    /// Verify the peer certificate chain and host name.
    pub verify_peer: bool,
    /// Extra PEM bundle of trusted roots.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM roots; unreadable entries are skipped.
    pub ca_path: Option<PathBuf>,
    /// Name checked against the certificate instead of the URL host.
    pub hostname: Option<String>,
    pub client_identity: Option<ClientIdentity>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            verify_peer: true,
            ca_file: None,
            ca_path: None,
            hostname: None,
            client_identity: None,
        }
    }
}

impl VerifyConfig {
    pub fn insecure() -> Self {
        Self {
            verify_peer: false,
            ..Self::default()
        }
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_client_identity(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.client_identity = Some(ClientIdentity {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
        self
    }
}

pub(crate) fn client_config(verify: &VerifyConfig) -> io::Result<Arc<ClientConfig>> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if verify.verify_peer {
        builder.with_root_certificates(root_store(verify)?)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
    };

    let mut config = match &verify.client_identity {
        Some(identity) => {
            let certs = CertificateDer::pem_file_iter(&identity.cert_file)
                .map_err(pem_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(pem_error)?;
            let key = PrivateKeyDer::from_pem_file(&identity.key_file).map_err(pem_error)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(tls_error)?
        }
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn root_store(verify: &VerifyConfig) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &verify.ca_file {
        for cert in CertificateDer::pem_file_iter(ca_file).map_err(pem_error)? {
            roots.add(cert.map_err(pem_error)?).map_err(tls_error)?;
        }
    }

    if let Some(ca_path) = &verify.ca_path {
        for entry in std::fs::read_dir(ca_path)? {
            let path = entry?.path();
            if !is_pem_candidate(&path) {
                continue;
            }
            match CertificateDer::pem_file_iter(&path) {
                Ok(certs) => {
                    let (added, ignored) = roots.add_parsable_certificates(certs.flatten());
                    log::debug!("loaded {added} roots from {} ({ignored} ignored)", path.display());
                }
                Err(err) => log::debug!("skipping {}: {err}", path.display()),
            }
        }
    }

    Ok(roots)
}

fn is_pem_candidate(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "pem" | "crt" | "cer"))
}

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}

fn pem_error(err: rustls::pki_types::pem::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well formed.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
