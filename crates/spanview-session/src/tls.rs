//! Optional TLS for WiFi sessions: a self-signed server certificate
//! persisted in the app-data directory, trust-on-first-use fingerprint
//! pinning on the client, and the six-digit pairing code both sides can
//! derive from the certificate.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::TlsError;
use crate::trust::{TrustDecision, TrustStore};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// The host's TLS identity: certificate chain plus private key.
pub struct ServerIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_der: Vec<u8>,
}

impl ServerIdentity {
    /// DER bytes of the leaf certificate (fingerprint / pairing input).
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// The six-digit pairing code derived from this certificate.
    pub fn pairing_code(&self) -> String {
        pairing_code(&self.cert_der)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_hex(&self.cert_der)
    }
}

/// Load the persisted identity from `dir`, generating and persisting a
/// fresh self-signed certificate on first run.
pub fn load_or_generate(dir: &Path) -> Result<ServerIdentity, TlsError> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return load_identity(&cert_path, &key_path);
    }

    info!(dir = %dir.display(), "generating self-signed session certificate");
    let names = vec!["spanview".to_string(), hostname()];
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TlsError::Certificate(format!("certificate generation failed: {e}")))?;

    let cert_pem = certified.cert.pem();
    let key_pem = Zeroizing::new(certified.key_pair.serialize_pem());

    std::fs::create_dir_all(dir)
        .map_err(|e| TlsError::Certificate(format!("cannot create {}: {e}", dir.display())))?;
    std::fs::write(&cert_path, cert_pem.as_bytes())
        .map_err(|e| TlsError::Certificate(format!("cannot write certificate: {e}")))?;
    write_key_file(&key_path, key_pem.as_bytes())?;

    load_identity(&cert_path, &key_path)
}

#[cfg(unix)]
fn write_key_file(path: &Path, pem: &[u8]) -> Result<(), TlsError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| TlsError::Certificate(format!("cannot open key file: {e}")))?;
    file.write_all(pem)
        .map_err(|e| TlsError::Certificate(format!("cannot write key file: {e}")))
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, pem: &[u8]) -> Result<(), TlsError> {
    std::fs::write(path, pem)
        .map_err(|e| TlsError::Certificate(format!("cannot write key file: {e}")))
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<ServerIdentity, TlsError> {
    let cert_data = std::fs::read(cert_path)
        .map_err(|e| TlsError::Certificate(format!("cannot read {}: {e}", cert_path.display())))?;
    let mut reader = std::io::BufReader::new(cert_data.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("cannot parse certificate: {e}")))?;
    let cert_der = certs
        .first()
        .map(|c| c.as_ref().to_vec())
        .ok_or_else(|| TlsError::Certificate(format!("no certificate in {}", cert_path.display())))?;

    let key_data = Zeroizing::new(
        std::fs::read(key_path)
            .map_err(|e| TlsError::Certificate(format!("cannot read {}: {e}", key_path.display())))?,
    );
    let mut reader = std::io::BufReader::new(key_data.as_slice());
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Certificate(format!("cannot parse key: {e}")))?
        .ok_or_else(|| TlsError::Certificate(format!("no private key in {}", key_path.display())))?;

    Ok(ServerIdentity { certs, key, cert_der })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// `SHA256(cert_der)[0..4]` big-endian modulo 1,000,000, six decimal
/// digits. A guard against casual mis-connects, not an authenticator.
pub fn pairing_code(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 1_000_000;
    format!("{n:06}")
}

/// Lowercase hex SHA-256 fingerprint of the DER certificate.
pub fn fingerprint_hex(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Constant-time pairing-code comparison.
pub fn pairing_code_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Build the server-side rustls config from the persisted identity.
pub fn server_config(identity: ServerIdentity) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.certs, identity.key)
        .map_err(|e| TlsError::Certificate(format!("invalid TLS identity: {e}")))?;
    Ok(Arc::new(config))
}

/// Details of a pin violation observed during the TLS handshake, kept
/// aside so the connect path can surface `TlsError::FingerprintMismatch`
/// instead of a generic handshake failure.
pub type MismatchSlot = Arc<Mutex<Option<TlsError>>>;

/// Build a client config that pins the server certificate via the trust
/// store instead of WebPKI. Returns the config plus the slot that records
/// a fingerprint mismatch, if one occurs.
pub fn client_config(trust: Arc<TrustStore>, host_key: String) -> (Arc<rustls::ClientConfig>, MismatchSlot) {
    let mismatch: MismatchSlot = Arc::new(Mutex::new(None));
    let verifier = PinnedServerVerifier { trust, host_key, mismatch: mismatch.clone() };
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    (Arc::new(config), mismatch)
}

/// Trust-on-first-use verifier: pins the SHA-256 fingerprint per
/// `host:port`; any later change is rejected until the user re-trusts.
#[derive(Debug)]
struct PinnedServerVerifier {
    trust: Arc<TrustStore>,
    host_key: String,
    mismatch: MismatchSlot,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint_hex(end_entity.as_ref());
        match self.trust.check_or_pin(&self.host_key, &presented) {
            TrustDecision::FirstUse | TrustDecision::Trusted => Ok(ServerCertVerified::assertion()),
            TrustDecision::Mismatch { pinned } => {
                warn!(host = %self.host_key, "certificate fingerprint changed; possible MITM");
                let err = TlsError::FingerprintMismatch {
                    host: self.host_key.clone(),
                    pinned,
                    presented,
                };
                let message = err.to_string();
                *self.mismatch.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
                Err(rustls::Error::General(message))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
