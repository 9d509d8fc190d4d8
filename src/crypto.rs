//! Access-means encryption using AES-256-GCM
//!
//! Direct-connection providers hand back an opaque access-means blob after
//! the consent exchange. It is stored encrypted at rest with additional
//! authenticated data (AAD) binding the ciphertext to the owning connection,
//! so a blob copied onto another row fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::user_site::Model as UserSiteModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // Stored layout: version byte, nonce, ciphertext + tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// AAD binding a ciphertext to its connection. All three components are
/// immutable for the life of the row.
fn access_means_aad(user_site: &UserSiteModel) -> String {
    format!(
        "{}|{}|{}",
        user_site.user_id, user_site.id, user_site.provider
    )
}

/// Encrypt an access-means blob for storage on its connection row.
pub fn encrypt_access_means(
    key: &CryptoKey,
    user_site: &UserSiteModel,
    means: &str,
) -> Result<Vec<u8>, CryptoError> {
    let aad = access_means_aad(user_site);
    encrypt_bytes(key, aad.as_bytes(), means.as_bytes())
}

/// Decrypt the access-means blob stored on a connection row, if any.
pub fn decrypt_access_means(
    key: &CryptoKey,
    user_site: &UserSiteModel,
) -> Result<Option<String>, CryptoError> {
    let Some(ciphertext) = user_site.access_means_ciphertext.as_ref() else {
        return Ok(None);
    };

    let aad = access_means_aad(user_site);
    let bytes = decrypt_bytes(key, aad.as_bytes(), ciphertext)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user_site::ConnectionStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    fn sample_user_site(access_means_ciphertext: Option<Vec<u8>>) -> UserSiteModel {
        UserSiteModel {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: "client-a".to_string(),
            site_id: Uuid::new_v4(),
            provider: "test-bank".to_string(),
            external_id: None,
            status: ConnectionStatus::Connected,
            failure_reason: None,
            status_timeout_at: None,
            last_data_fetch: None,
            redirect_url_id: Uuid::new_v4(),
            persisted_form_answers: None,
            migration_status: None,
            access_means_ciphertext,
            access_means_created_at: None,
            access_means_expires_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"secret message";

        let encrypted = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_different_aad_fails() {
        let key = test_key();
        let plaintext = b"secret message";

        let encrypted = encrypt_bytes(&key, b"test-aad-1", plaintext).expect("encryption succeeds");
        let result = decrypt_bytes(&key, b"test-aad-2", &encrypted);

        assert!(result.is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails() {
        let key = test_key();
        let aad = b"test-aad";

        let mut encrypted = encrypt_bytes(&key, aad, b"secret message").expect("encryption succeeds");
        encrypted[13] ^= 0x01;

        let result = decrypt_bytes(&key, aad, &encrypted);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_plaintext_works() {
        let key = test_key();
        let aad = b"test-aad";

        let encrypted = encrypt_bytes(&key, aad, b"").expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert_eq!(decrypted, b"");
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"secret message";

        let encrypted1 = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let encrypted2 = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");

        // Nonces (bytes 1-13) should be different
        assert_ne!(&encrypted1[1..13], &encrypted2[1..13]);
        let decrypted1 = decrypt_bytes(&key, aad, &encrypted1).expect("decryption succeeds");
        let decrypted2 = decrypt_bytes(&key, aad, &encrypted2).expect("decryption succeeds");
        assert_eq!(decrypted1, plaintext);
        assert_eq!(decrypted2, plaintext);
    }

    #[test]
    fn test_unversioned_payload_rejected() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"test-aad", &[0xFF, 0x01, 0x02, 0x03]);
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn test_insufficient_ciphertext_length() {
        let key = test_key();
        let short_ciphertext = vec![VERSION_ENCRYPTED, 0x02];

        let result = decrypt_bytes(&key, b"test-aad", &short_ciphertext);
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_access_means_bound_to_row() {
        let key = test_key();
        let user_site = sample_user_site(None);

        let ciphertext = encrypt_access_means(&key, &user_site, "{\"token\":\"abc\"}")
            .expect("encryption succeeds");

        let mut stored = user_site.clone();
        stored.access_means_ciphertext = Some(ciphertext.clone());
        let decrypted = decrypt_access_means(&key, &stored).expect("decryption succeeds");
        assert_eq!(decrypted.as_deref(), Some("{\"token\":\"abc\"}"));

        // Same ciphertext on a different row must not decrypt
        let mut other = sample_user_site(Some(ciphertext));
        other.provider = user_site.provider.clone();
        assert!(decrypt_access_means(&key, &other).is_err());
    }

    #[test]
    fn test_absent_access_means_is_none() {
        let key = test_key();
        let user_site = sample_user_site(None);
        let decrypted = decrypt_access_means(&key, &user_site).expect("no means to decrypt");
        assert!(decrypted.is_none());
    }
}
