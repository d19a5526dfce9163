//! Field-level encryption for data at rest.
//!
//! Sensitive columns (paths, metadata maps) are encrypted individually with
//! AES-256-GCM. The key is derived once per process from the operator
//! passphrase via PBKDF2-HMAC-SHA256 with a fixed salt: the database file is
//! the unit of secrecy, so a per-database salt would add nothing here. Each
//! ciphertext embeds its own random nonce (`nonce ‖ ciphertext ‖ tag`,
//! base64), so encrypting the same plaintext twice yields distinct blobs.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::StoreError;

const KDF_SALT: &[u8] = b"honeygrid_salt_v1";
const KDF_ITERATIONS: u32 = 100_000;
const GCM_NONCE_LEN: usize = 12;

/// AEAD cipher over individual string fields.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Derives the process key from the operator passphrase. The passphrase
    /// itself is never stored.
    pub fn derive(passphrase: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypts a field; output is base64 of `nonce ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| StoreError::Crypto("field encryption failed".into()))?;
        let mut blob = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    /// Reverses [`encrypt`]; fails on truncation, tampering or a wrong key.
    pub fn decrypt(&self, blob: &str) -> Result<String, StoreError> {
        let raw = B64
            .decode(blob)
            .map_err(|err| StoreError::Crypto(format!("invalid ciphertext encoding: {err}")))?;
        if raw.len() <= GCM_NONCE_LEN {
            return Err(StoreError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(GCM_NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto("field decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|err| StoreError::Crypto(format!("decrypted field not utf-8: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = FieldCipher::derive("correct horse battery staple");
        let blob = cipher.encrypt("/srv/decoys/payroll.xlsx").unwrap();
        assert_ne!(blob, "/srv/decoys/payroll.xlsx");
        assert_eq!(cipher.decrypt(&blob).unwrap(), "/srv/decoys/payroll.xlsx");
    }

    #[test]
    fn same_plaintext_distinct_ciphertexts() {
        let cipher = FieldCipher::derive("pw");
        let a = cipher.encrypt("secret").unwrap();
        let b = cipher.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let blob = FieldCipher::derive("pw-one").encrypt("secret").unwrap();
        assert!(matches!(
            FieldCipher::derive("pw-two").decrypt(&blob),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = FieldCipher::derive("pw");
        let blob = cipher.encrypt("secret").unwrap();
        let mut raw = B64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&B64.encode(raw)),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn malformed_blobs_rejected() {
        let cipher = FieldCipher::derive("pw");
        assert!(cipher.decrypt("not base64!!").is_err());
        assert!(cipher.decrypt(&B64.encode([0u8; 8])).is_err());
    }
}
