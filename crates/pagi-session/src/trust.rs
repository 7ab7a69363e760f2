//! Trust-on-first-use pinning of the gateway's TLS certificate.
//!
//! The first certificate seen for a host is accepted and its SHA-256 fingerprint pinned. Every
//! later handshake must present the same certificate. There is no certificate-authority
//! fallback: after first use the pin is the only trust anchor.

use crate::error::{GatewayError, GatewayResult};
use crate::store::KeyValueStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const PIN_PREFIX: &str = "tls.pin.";

fn pin_key(host: &str) -> String {
    format!("{}{}", PIN_PREFIX, host.trim().to_ascii_lowercase())
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Outcome of checking a presented fingerprint against the pin store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    /// No pin existed; the fingerprint is now pinned.
    PinnedOnFirstUse,
    /// Matches the stored pin.
    Matched,
}

/// Host → fingerprint pins. Check-and-pin is serialized so a host only ever has one writer.
pub struct TrustStore {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pinned_fingerprint(&self, host: &str) -> GatewayResult<Option<String>> {
        self.store.get(&pin_key(host))
    }

    /// Accept `fingerprint` for `host` on first use, otherwise require equality with the pin.
    pub fn verify_fingerprint(&self, host: &str, fingerprint: &str) -> GatewayResult<PinOutcome> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| GatewayError::Storage(format!("pin lock poisoned: {}", e)))?;
        let key = pin_key(host);
        match self.store.get(&key)? {
            None => {
                self.store.put(&key, fingerprint)?;
                info!(host = %host, fingerprint = %fingerprint, "Pinned gateway certificate on first use");
                Ok(PinOutcome::PinnedOnFirstUse)
            }
            Some(expected) if expected.eq_ignore_ascii_case(fingerprint) => Ok(PinOutcome::Matched),
            Some(expected) => {
                warn!(host = %host, expected = %expected, actual = %fingerprint, "Gateway certificate fingerprint mismatch");
                Err(GatewayError::FingerprintMismatch {
                    host: host.to_string(),
                    expected,
                    actual: fingerprint.to_string(),
                })
            }
        }
    }

    /// Forget the pin for `host`; the next handshake pins again.
    pub fn clear_pin(&self, host: &str) -> GatewayResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| GatewayError::Storage(format!("pin lock poisoned: {}", e)))?;
        self.store.remove(&pin_key(host))?;
        info!(host = %host, "Cleared pinned gateway certificate");
        Ok(())
    }
}

/// rustls verifier that enforces the pin for one host.
///
/// A rejected handshake leaves the mismatch in `last_failure` so the transport can report it as
/// `GatewayError::FingerprintMismatch` rather than an opaque TLS alert.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    host: String,
    trust: Arc<TrustStore>,
    provider: Arc<CryptoProvider>,
    last_failure: Mutex<Option<GatewayError>>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore").finish_non_exhaustive()
    }
}

impl PinnedCertVerifier {
    pub fn new(host: impl Into<String>, trust: Arc<TrustStore>) -> Self {
        Self {
            host: host.into(),
            trust,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            last_failure: Mutex::new(None),
        }
    }

    /// Take the failure recorded by the most recent rejected handshake, if any.
    pub fn take_failure(&self) -> Option<GatewayError> {
        self.last_failure.lock().ok().and_then(|mut slot| slot.take())
    }

    fn record_failure(&self, err: GatewayError) {
        if let Ok(mut slot) = self.last_failure.lock() {
            *slot = Some(err);
        }
    }

    /// Build a rustls client config that trusts only this verifier.
    pub fn client_config(self: &Arc<Self>) -> GatewayResult<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Transport(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(self) as Arc<dyn ServerCertVerifier>)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let fingerprint = certificate_fingerprint(end_entity.as_ref());
        match self.trust.verify_fingerprint(&self.host, &fingerprint) {
            Ok(_) => Ok(ServerCertVerified::assertion()),
            Err(err @ GatewayError::FingerprintMismatch { .. }) => {
                self.record_failure(err);
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.record_failure(err);
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
