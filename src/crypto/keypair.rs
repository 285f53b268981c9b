//! Ed25519 Key Pair Management
//!
//! Die lokale Identität: der Public Key (Base64) ist gleichzeitig die
//! [`ChatId`](crate::call_engine::ChatId), unter der uns andere Peers anrufen.
//! Alle Signale über das Relay werden damit signiert.
//!
//! ## Verwendung
//! ```no_run
//! # use avcall::crypto::KeyPair;
//! let keypair = KeyPair::load_or_create(std::path::Path::new("/tmp/avcall"))?;
//! let signature = keypair.sign_base64(b"Hello, World!");
//! let public_key_base64 = keypair.public_key_base64();
//! # Ok::<(), avcall::crypto::KeyPairError>(())
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode key or signature: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature does not match")]
    BadSignature,
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

/// Ed25519 Schlüsselpaar
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt den Schlüssel aus `<data_dir>/keys/private.key` oder erzeugt einen neuen
    pub fn load_or_create(data_dir: &Path) -> Result<Self, KeyPairError> {
        let key_path = Self::key_path(data_dir);

        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(&key_path)?;
            Ok(keypair)
        }
    }

    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join("keys").join("private.key")
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let key_bytes = decode_key(encoded.trim())?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Signiert ein JSON-Objekt (Keys sortiert, Feld `signature` ausgenommen)
    pub fn sign_message(&self, payload: &serde_json::Value) -> String {
        self.sign_base64(canonical_bytes(payload).as_slice())
    }

    /// Prüft eine mit [`KeyPair::sign_message`] erzeugte Signatur
    pub fn verify_message(
        public_key_base64: &str,
        payload: &serde_json::Value,
        signature_base64: &str,
    ) -> Result<(), KeyPairError> {
        let key_bytes = decode_key(public_key_base64)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyPairError::InvalidPublicKey)?;

        let sig_bytes: [u8; 64] = BASE64
            .decode(signature_base64)?
            .try_into()
            .map_err(|_| KeyPairError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(&canonical_bytes(payload), &signature)
            .map_err(|_| KeyPairError::BadSignature)
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], KeyPairError> {
    let bytes = BASE64.decode(encoded)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyPairError::InvalidKeyLength(len))
}

fn canonical_bytes(payload: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&sort_json_object(payload)).unwrap_or_default()
}

/// Sortiert ein JSON-Objekt rekursiv nach Keys und entfernt `signature`
fn sort_json_object(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_json_object(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_json_object).collect())
        }
        other => other.clone(),
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_is_44_chars() {
        assert_eq!(KeyPair::generate().public_key_base64().len(), 44);
    }

    #[test]
    fn test_sign_and_verify_message() {
        let keypair = KeyPair::generate();
        let payload = serde_json::json!({
            "to": "bob",
            "message": { "type": "hangup" },
            "timestamp": 1234567890
        });

        let signature = keypair.sign_message(&payload);
        assert_eq!(signature.len(), 88);
        assert!(KeyPair::verify_message(&keypair.public_key_base64(), &payload, &signature).is_ok());
    }

    #[test]
    fn test_signature_ignores_field_order_and_signature_field() {
        let keypair = KeyPair::generate();
        let payload = serde_json::json!({ "a": 1, "b": 2 });
        let signature = keypair.sign_message(&payload);

        let reordered = serde_json::json!({ "b": 2, "a": 1, "signature": signature });
        assert!(KeyPair::verify_message(&keypair.public_key_base64(), &reordered, &signature).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign_message(&serde_json::json!({ "bitrate": 48 }));

        let result = KeyPair::verify_message(
            &keypair.public_key_base64(),
            &serde_json::json!({ "bitrate": 510 }),
            &signature,
        );
        assert!(matches!(result, Err(KeyPairError::BadSignature)));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = std::env::temp_dir().join(format!("avcall-keys-{}", uuid::Uuid::new_v4()));

        let first = KeyPair::load_or_create(&dir).unwrap();
        let second = KeyPair::load_or_create(&dir).unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());

        let _ = fs::remove_dir_all(&dir);
    }
}
