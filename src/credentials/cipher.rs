//! Credential encryption at rest
//!
//! Stored upstream tokens are wrapped in a versioned, self-describing
//! envelope:
//!
//! ```text
//! uenc:v1:<base64 nonce>:<base64 ciphertext+tag>
//! ```
//!
//! The AEAD key is derived per user from the process secret and the user id,
//! so an envelope copied into another user's row will not decrypt. Values
//! without the `uenc:` marker are legacy plaintext rows; [`is_encrypted`]
//! lets callers migrate them incrementally instead of all at once.
//!
//! Every decryption failure maps to `CredentialInvalid`, never to a generic
//! error: the correct client reaction is re-linking the media account, and
//! clients need to be able to tell that apart from transient faults.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

use crate::credentials::UpstreamCredential;
use crate::secret::SecretStore;
use crate::types::{Result, UsherError};

/// Envelope marker shared by all versions.
pub const ENVELOPE_PREFIX: &str = "uenc:";

/// Current envelope version prefix.
const ENVELOPE_V1: &str = "uenc:v1:";

/// ChaCha20-Poly1305 nonce length.
const NONCE_LEN: usize = 12;

/// Domain separation tag for per-user key derivation.
const KEY_CONTEXT: &[u8] = b"usher-credential-key-v1";

/// True for any value produced by [`CredentialCipher::encrypt`], false for
/// legacy plaintext rows.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Encrypts and decrypts per-user credential envelopes.
pub struct CredentialCipher {
    secrets: Arc<SecretStore>,
}

impl CredentialCipher {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self { secrets }
    }

    /// Encrypt a plaintext payload for the given user.
    pub fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String> {
        let mut key = self.user_key(user_id);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let result = cipher.encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes());
        key.zeroize();

        let ciphertext = result
            .map_err(|e| UsherError::Internal(format!("Credential encryption failed: {}", e)))?;

        Ok(format!(
            "{}{}:{}",
            ENVELOPE_V1,
            BASE64.encode(nonce),
            BASE64.encode(&ciphertext)
        ))
    }

    /// Decrypt an envelope previously produced for the same user.
    ///
    /// Any failure, from a version this build does not know to an AEAD tag
    /// mismatch, comes back as `CredentialInvalid`.
    pub fn decrypt(&self, user_id: &str, envelope: &str) -> Result<String> {
        let rest = envelope.strip_prefix(ENVELOPE_V1).ok_or_else(|| {
            if envelope.starts_with(ENVELOPE_PREFIX) {
                UsherError::CredentialInvalid("Unknown credential envelope version".to_string())
            } else {
                UsherError::CredentialInvalid("Value is not an encrypted envelope".to_string())
            }
        })?;

        let (nonce_b64, ciphertext_b64) = rest.split_once(':').ok_or_else(|| {
            UsherError::CredentialInvalid("Malformed credential envelope".to_string())
        })?;

        let nonce = BASE64.decode(nonce_b64).map_err(|_| {
            UsherError::CredentialInvalid("Malformed credential envelope nonce".to_string())
        })?;
        if nonce.len() != NONCE_LEN {
            return Err(UsherError::CredentialInvalid(
                "Bad credential envelope nonce length".to_string(),
            ));
        }

        let ciphertext = BASE64.decode(ciphertext_b64).map_err(|_| {
            UsherError::CredentialInvalid("Malformed credential envelope ciphertext".to_string())
        })?;

        let mut key = self.user_key(user_id);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let result = cipher.decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice());
        key.zeroize();

        let plaintext = result.map_err(|_| {
            UsherError::CredentialInvalid("Credential decryption failed".to_string())
        })?;

        String::from_utf8(plaintext).map_err(|_| {
            UsherError::CredentialInvalid("Decrypted credential is not valid UTF-8".to_string())
        })
    }

    /// Encrypt an upstream credential for storage in the user row.
    pub fn seal_credential(
        &self,
        user_id: &str,
        credential: &UpstreamCredential,
    ) -> Result<String> {
        let payload = serde_json::to_string(credential)
            .map_err(|e| UsherError::Internal(format!("Credential serialization failed: {}", e)))?;
        self.encrypt(user_id, &payload)
    }

    /// Decrypt a stored envelope back into an upstream credential.
    pub fn open_credential(&self, user_id: &str, envelope: &str) -> Result<UpstreamCredential> {
        let payload = self.decrypt(user_id, envelope)?;
        serde_json::from_str(&payload).map_err(|_| {
            UsherError::CredentialInvalid("Stored credential has an unexpected shape".to_string())
        })
    }

    /// Derive the per-user AEAD key: SHA-256(context || process secret || user id).
    ///
    /// The process secret is full-entropy random material, so a single hash
    /// is sufficient; a password KDF would only add startup latency.
    fn user_key(&self, user_id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(self.secrets.secret());
        hasher.update(user_id.as_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_cipher() -> CredentialCipher {
        let value = hex::encode([42u8; crate::secret::SECRET_LEN]);
        let store = SecretStore::load(Some(&value), Path::new("/nonexistent")).unwrap();
        CredentialCipher::new(Arc::new(store))
    }

    #[test]
    fn test_roundtrip() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("user-1", "sekrit-upstream-token").unwrap();
        assert!(envelope.starts_with("uenc:v1:"));
        assert_eq!(
            cipher.decrypt("user-1", &envelope).unwrap(),
            "sekrit-upstream-token"
        );
    }

    #[test]
    fn test_roundtrip_unicode_and_empty() {
        let cipher = test_cipher();
        for plaintext in ["", "tök€n-ünïcode", "{\"json\":true}"] {
            let envelope = cipher.encrypt("user-1", plaintext).unwrap();
            assert_eq!(cipher.decrypt("user-1", &envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_makes_envelopes_unique() {
        let cipher = test_cipher();
        let a = cipher.encrypt("user-1", "same").unwrap();
        let b = cipher.encrypt("user-1", "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cross_user_decrypt_fails() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("user-1", "token").unwrap();
        let err = cipher.decrypt("user-2", &envelope).unwrap_err();
        assert!(matches!(err, UsherError::CredentialInvalid(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("user-1", "token").unwrap();
        let mut tampered = envelope.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        let err = cipher.decrypt("user-1", &tampered).unwrap_err();
        assert!(matches!(err, UsherError::CredentialInvalid(_)));
    }

    #[test]
    fn test_unknown_version_fails() {
        let cipher = test_cipher();
        let err = cipher.decrypt("user-1", "uenc:v9:AAAA:BBBB").unwrap_err();
        assert!(matches!(err, UsherError::CredentialInvalid(_)));
    }

    #[test]
    fn test_plaintext_value_fails_decrypt() {
        let cipher = test_cipher();
        let err = cipher.decrypt("user-1", "legacy-plaintext-token").unwrap_err();
        assert!(matches!(err, UsherError::CredentialInvalid(_)));
    }

    #[test]
    fn test_is_encrypted() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("user-1", "token").unwrap();
        assert!(is_encrypted(&envelope));
        assert!(!is_encrypted("legacy-plaintext-token"));
        assert!(!is_encrypted(""));
    }

    #[test]
    fn test_credential_struct_roundtrip() {
        let cipher = test_cipher();
        let credential = UpstreamCredential {
            token: "abc123".to_string(),
            server_url: "https://media.example.com".to_string(),
            server_id: "srv-1".to_string(),
        };
        let envelope = cipher.seal_credential("user-1", &credential).unwrap();
        assert!(is_encrypted(&envelope));
        assert_eq!(cipher.open_credential("user-1", &envelope).unwrap(), credential);
    }

    #[test]
    fn test_different_secret_cannot_decrypt() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("user-1", "token").unwrap();

        let other_value = hex::encode([43u8; crate::secret::SECRET_LEN]);
        let other_store = SecretStore::load(Some(&other_value), Path::new("/nonexistent")).unwrap();
        let other = CredentialCipher::new(Arc::new(other_store));
        assert!(matches!(
            other.decrypt("user-1", &envelope),
            Err(UsherError::CredentialInvalid(_))
        ));
    }
}
