use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_PREFIX: &str = "cnd_sk_";

/// Number of leading characters kept for display; the rest of the raw key is
/// discarded after hashing.
const PREFIX_DISPLAY_LEN: usize = 12;

const PBKDF2_ROUNDS: u32 = 480_000;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Full key material, returned to the caller exactly once.
    pub raw: String,
    /// Hex SHA-256 digest stored for lookup.
    pub hash: String,
    /// Non-secret display prefix, e.g. `cnd_sk_Ab12`.
    pub prefix: String,
}

/// Mint a new `cnd_sk_<base64url32>` API key.
pub fn generate_api_key() -> GeneratedKey {
    let mut secret = [0u8; 32];
    rand::rng().fill_bytes(&mut secret);
    let raw = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(secret));
    GeneratedKey {
        hash: hash_api_key(&raw),
        prefix: raw[..PREFIX_DISPLAY_LEN].to_string(),
        raw,
    }
}

pub fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("decrypted credential is not utf-8")]
    Utf8,
}

/// AES-256-GCM cipher for upstream credentials at rest. The key is derived
/// once per process from the configured secret and salt.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn derive(secret: &str, salt: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut key);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt a plaintext credential to `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        // Aes256Gcm::encrypt only fails on absurd plaintext lengths.
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .unwrap_or_default();
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        STANDARD.encode(sealed)
    }

    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let bytes = STANDARD.decode(sealed).map_err(|_| CipherError::Encoding)?;
        if bytes.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_well_formed() {
        let key = generate_api_key();
        assert!(key.raw.starts_with(KEY_PREFIX));
        assert_eq!(key.prefix.len(), PREFIX_DISPLAY_LEN);
        assert!(key.raw.starts_with(&key.prefix));
        assert_eq!(key.hash.len(), 64);
        assert_eq!(key.hash, hash_api_key(&key.raw));
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_api_key().raw, generate_api_key().raw);
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = CredentialCipher::derive("test-secret", "test-salt");
        let sealed = cipher.seal("sk-upstream-credential");
        assert_ne!(sealed, "sk-upstream-credential");
        assert_eq!(cipher.open(&sealed).unwrap(), "sk-upstream-credential");
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = CredentialCipher::derive("secret-a", "salt").seal("value");
        let other = CredentialCipher::derive("secret-b", "salt");
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn open_rejects_garbage() {
        let cipher = CredentialCipher::derive("secret", "salt");
        assert!(matches!(cipher.open("%%%"), Err(CipherError::Encoding)));
        assert!(matches!(cipher.open("AAAA"), Err(CipherError::Truncated)));
    }
}
