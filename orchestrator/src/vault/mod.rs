//! Credential vault
//!
//! Host secrets, database passwords and connection strings are stored sealed.
//! Sealed values have the form `v1:<base64(nonce || ciphertext)>` and are
//! produced with AES-256-GCM under a single master key.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::utils::sha256_hex;

/// Environment variable holding a base64 master key
pub const VAULT_KEY_ENV: &str = "DOCKHAND_VAULT_KEY";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEALED_PREFIX: &str = "v1:";

/// Symmetric cipher used by the vault
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, OrchestratorError>;

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, OrchestratorError>;

    /// Stable, non-secret identifier of the active key
    fn key_id(&self) -> String;
}

/// AES-256-GCM with a random 96-bit nonce prepended to each ciphertext
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    key_id: String,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, OrchestratorError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            OrchestratorError::CryptoError(format!("vault key must be {} bytes", KEY_LEN))
        })?;
        let key_id = sha256_hex(key)[..12].to_string();
        Ok(Self { cipher, key_id })
    }

    /// Resolve the master key from the environment, the key file, or a freshly
    /// generated key that is then written to the key file.
    pub async fn load_or_create(key_file: &File) -> Result<Self, OrchestratorError> {
        if let Ok(encoded) = std::env::var(VAULT_KEY_ENV) {
            return Self::new(&decode_key(&encoded)?);
        }

        if key_file.exists().await {
            #[cfg(unix)]
            check_key_permissions(key_file).await?;
            let contents = key_file.read_bytes().await?;
            let encoded = String::from_utf8_lossy(&contents);
            return Self::new(&decode_key(encoded.trim())?);
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key_file
            .write_private(STANDARD.encode(key).as_bytes())
            .await?;
        info!("Generated vault key at {}", key_file.path().display());
        Self::new(&key)
    }
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, OrchestratorError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| OrchestratorError::CryptoError(format!("invalid vault key encoding: {}", e)))
}

#[cfg(unix)]
async fn check_key_permissions(key_file: &File) -> Result<(), OrchestratorError> {
    use std::os::unix::fs::MetadataExt;

    let mode = tokio::fs::metadata(key_file.path()).await?.mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(OrchestratorError::CryptoError(format!(
            "vault key file {} has insecure mode {:o}",
            key_file.path().display(),
            mode
        )));
    }
    Ok(())
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, OrchestratorError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| OrchestratorError::CryptoError("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, OrchestratorError> {
        if sealed.len() <= NONCE_LEN {
            return Err(OrchestratorError::CryptoError(
                "sealed value is truncated".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                OrchestratorError::CryptoError(
                    "decryption failed (wrong key or tampered value)".to_string(),
                )
            })
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }
}

/// Seals and opens credential strings
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Arc<dyn SecretCipher>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault")
    }
}

impl CredentialVault {
    pub fn new(cipher: Arc<dyn SecretCipher>) -> Self {
        Self { cipher }
    }

    pub fn key_id(&self) -> String {
        self.cipher.key_id()
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, OrchestratorError> {
        let sealed = self.cipher.encrypt(plaintext.as_bytes())?;
        Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(sealed)))
    }

    pub fn seal_secret(&self, secret: &SecretString) -> Result<String, OrchestratorError> {
        self.seal(secret.expose_secret())
    }

    pub fn open(&self, sealed: &str) -> Result<SecretString, OrchestratorError> {
        let encoded = sealed.strip_prefix(SEALED_PREFIX).ok_or_else(|| {
            OrchestratorError::CryptoError("unrecognized sealed value format".to_string())
        })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| OrchestratorError::CryptoError(format!("invalid sealed value: {}", e)))?;
        let plaintext = self.cipher.decrypt(&bytes)?;
        let text = String::from_utf8(plaintext).map_err(|_| {
            OrchestratorError::CryptoError("sealed value is not valid UTF-8".to_string())
        })?;
        Ok(SecretString::from(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(Arc::new(AesGcmCipher::new(&[7u8; KEY_LEN]).unwrap()))
    }

    #[test]
    fn test_seal_open_round_trip() {
        let vault = vault();
        let sealed = vault.seal("hunter2").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(vault.open(&sealed).unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn test_same_plaintext_seals_differently() {
        let vault = vault();
        assert_ne!(vault.seal("same").unwrap(), vault.seal("same").unwrap());
    }

    #[test]
    fn test_tampered_value_fails() {
        let vault = vault();
        let sealed = vault.seal("secret").unwrap();
        let mut bytes = STANDARD.decode(&sealed[3..]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = format!("v1:{}", STANDARD.encode(bytes));
        assert!(vault.open(&tampered).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = vault().seal("secret").unwrap();
        let other = CredentialVault::new(Arc::new(AesGcmCipher::new(&[9u8; KEY_LEN]).unwrap()));
        assert_ne!(other.key_id(), vault().key_id());
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(AesGcmCipher::new(&[1u8; 16]).is_err());
    }

    #[tokio::test]
    async fn test_key_file_is_created_and_reused() {
        if std::env::var(VAULT_KEY_ENV).is_ok() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let key_file = File::new(temp.path().join("keys").join("vault.key"));

        let first = CredentialVault::new(Arc::new(
            AesGcmCipher::load_or_create(&key_file).await.unwrap(),
        ));
        let sealed = first.seal("persisted").unwrap();
        assert!(key_file.exists().await);

        let second = CredentialVault::new(Arc::new(
            AesGcmCipher::load_or_create(&key_file).await.unwrap(),
        ));
        assert_eq!(second.open(&sealed).unwrap().expose_secret(), "persisted");
    }
}
