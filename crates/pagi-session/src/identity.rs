//! **Device identity** - the long-lived Ed25519 keypair that identifies this installation.
//!
//! Created once and persisted for the life of the installation. The device id is the hex
//! SHA-256 digest of the raw public key. The signing key never leaves this module.

use crate::error::{GatewayError, GatewayResult};
use crate::store::KeyValueStore;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{info, warn};

const IDENTITY_KEY: &str = "device.identity";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    device_id: String,
    public_key: String,
    private_key: String,
}

/// Device keypair plus its derived, stable fingerprint.
pub struct DeviceIdentity {
    device_id: String,
    public_key: [u8; 32],
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Load the persisted identity or generate, persist and return a new one.
    pub fn get_or_create(store: &dyn KeyValueStore) -> GatewayResult<Self> {
        if let Some(raw) = store.get(IDENTITY_KEY)? {
            let stored: StoredIdentity = serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Identity(format!("corrupt stored identity: {}", e)))?;
            let identity = Self::from_stored(&stored)?;
            if identity.device_id != stored.device_id {
                warn!(
                    stored = %stored.device_id,
                    derived = %identity.device_id,
                    "Stored device id does not match its key; using derived id"
                );
                identity.persist(store)?;
            }
            return Ok(identity);
        }

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let identity = Self::from_signing_key(signing_key);
        identity.persist(store)?;
        info!(device_id = %identity.device_id, "Generated new device identity");
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            device_id: derive_device_id(&public_key),
            public_key,
            signing_key,
        }
    }

    fn from_stored(stored: &StoredIdentity) -> GatewayResult<Self> {
        let private = URL_SAFE_NO_PAD
            .decode(stored.private_key.as_bytes())
            .map_err(|e| GatewayError::Identity(format!("private key encoding: {}", e)))?;
        let private: [u8; 32] = private
            .try_into()
            .map_err(|_| GatewayError::Identity("private key must be 32 bytes".to_string()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&private)))
    }

    fn persist(&self, store: &dyn KeyValueStore) -> GatewayResult<()> {
        let stored = StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: self.public_key_base64url(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
        };
        store.put(IDENTITY_KEY, &serde_json::to_string(&stored)?)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Raw public key, base64url without padding (the wire encoding).
    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key)
    }

    /// Deterministic Ed25519 signature over the UTF-8 bytes of `payload`, base64url encoded.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key_base64url())
            .finish_non_exhaustive()
    }
}

/// Lowercase hex SHA-256 of the raw public key.
pub fn derive_device_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn identity_is_created_once() {
        let store = MemoryStore::new();
        let first = DeviceIdentity::get_or_create(&store).unwrap();
        let second = DeviceIdentity::get_or_create(&store).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.device_id().len(), 64);
        assert_eq!(first.device_id(), derive_device_id(first.public_key()));
    }

    #[test]
    fn signature_verifies_and_is_deterministic() {
        let store = MemoryStore::new();
        let identity = DeviceIdentity::get_or_create(&store).unwrap();
        let payload = "v2|dev|client|ui|operator||1700000000000||nonce";
        let a = identity.sign(payload);
        assert_eq!(a, identity.sign(payload));

        let raw = URL_SAFE_NO_PAD.decode(a).unwrap();
        let signature = Signature::from_slice(&raw).unwrap();
        let key = VerifyingKey::from_bytes(identity.public_key()).unwrap();
        assert!(key.verify(payload.as_bytes(), &signature).is_ok());
    }

    #[test]
    fn debug_output_hides_private_key() {
        let store = MemoryStore::new();
        let identity = DeviceIdentity::get_or_create(&store).unwrap();
        let stored: StoredIdentity =
            serde_json::from_str(&store.get(IDENTITY_KEY).unwrap().unwrap()).unwrap();
        let debug = format!("{:?}", identity);
        assert!(!debug.contains(&stored.private_key));
    }
}
