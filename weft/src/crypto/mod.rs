//! AES-256-GCM encryption for trace bodies and conversation content.
//!
//! A process-wide master key is loaded at startup; the per-tenant data key is
//! derived from it with HKDF-SHA-256 over the tenant id. Every encryption
//! draws a fresh 96-bit IV, stored as 24 lowercase hex chars next to the
//! base64 ciphertext (GCM tag appended). `key_version` is recorded with each
//! row; decryption returns an error on version mismatch or tag failure, never
//! panics.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

/// IV length in bytes (96-bit GCM nonce).
pub const IV_LEN: usize = 12;

/// HKDF info prefix; the tenant id is appended so each tenant gets its own key.
const KEY_INFO_PREFIX: &[u8] = b"weft/tenant-data-key/";

/// Errors from the crypto service.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (bad ciphertext or tag)")]
    Decrypt,
    #[error("key version mismatch: row has v{row}, service has v{service}")]
    KeyVersion { row: u32, service: u32 },
    #[error("invalid iv: {0}")]
    InvalidIv(String),
}

/// Ciphertext plus the IV it was sealed with, both in storage encoding.
#[derive(Debug, Clone)]
pub struct Encrypted {
    /// Base64 ciphertext with the 128-bit GCM tag appended.
    pub ciphertext: String,
    /// 24-char lowercase hex encoding of the 96-bit IV.
    pub iv: String,
}

/// Process-wide encryption service. One instance is constructed at startup
/// and shared by the conversation manager and trace recorder.
pub struct CryptoService {
    master: [u8; 32],
    key_version: u32,
}

impl CryptoService {
    /// Builds the service from a configured master key (base64 or hex, 32 bytes).
    pub fn new(master_key: &str, key_version: u32) -> Result<Self, CryptoError> {
        let raw = decode_master_key(master_key)?;
        Ok(Self {
            master: raw,
            key_version,
        })
    }

    /// Builds the service with a random ephemeral master key.
    ///
    /// Development-mode fallback when `ENCRYPTION_MASTER_KEY` is unset;
    /// content encrypted with it is unreadable after restart.
    pub fn ephemeral(key_version: u32) -> Self {
        let mut master = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master);
        Self {
            master,
            key_version,
        }
    }

    /// Version recorded alongside every ciphertext produced by this service.
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Derives the tenant data key: HKDF-SHA-256(master, info = prefix + tenant id).
    fn tenant_key(&self, tenant_id: Uuid) -> Key<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(None, &self.master);
        let mut info = Vec::with_capacity(KEY_INFO_PREFIX.len() + 36);
        info.extend_from_slice(KEY_INFO_PREFIX);
        info.extend_from_slice(tenant_id.to_string().as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .expect("32-byte okm is within hkdf-sha256 bounds");
        Key::<Aes256Gcm>::from(okm)
    }

    /// Encrypts `plaintext` under the tenant's derived key with a fresh IV.
    pub fn encrypt(&self, tenant_id: Uuid, plaintext: &[u8]) -> Result<Encrypted, CryptoError> {
        let cipher = Aes256Gcm::new(&self.tenant_key(tenant_id));
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(Encrypted {
            ciphertext: B64.encode(ciphertext),
            iv: hex::encode(iv),
        })
    }

    /// Convenience wrapper around [`encrypt`](Self::encrypt) for text content.
    pub fn encrypt_str(&self, tenant_id: Uuid, plaintext: &str) -> Result<Encrypted, CryptoError> {
        self.encrypt(tenant_id, plaintext.as_bytes())
    }

    /// Decrypts a stored ciphertext.
    ///
    /// Fails cleanly with [`CryptoError::KeyVersion`] when `key_version` does
    /// not match the service, and [`CryptoError::Decrypt`] when the tag does
    /// not verify (wrong tenant, corrupted row, rotated key).
    pub fn decrypt(
        &self,
        tenant_id: Uuid,
        ciphertext: &str,
        iv: &str,
        key_version: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        if key_version != self.key_version {
            return Err(CryptoError::KeyVersion {
                row: key_version,
                service: self.key_version,
            });
        }
        let iv_raw = hex::decode(iv).map_err(|e| CryptoError::InvalidIv(e.to_string()))?;
        if iv_raw.len() != IV_LEN {
            return Err(CryptoError::InvalidIv(format!(
                "expected {} bytes, got {}",
                IV_LEN,
                iv_raw.len()
            )));
        }
        let raw = B64.decode(ciphertext).map_err(|_| CryptoError::Decrypt)?;
        let cipher = Aes256Gcm::new(&self.tenant_key(tenant_id));
        cipher
            .decrypt(Nonce::from_slice(&iv_raw), raw.as_ref())
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Decrypts to UTF-8 text; invalid UTF-8 is treated as a decrypt failure.
    pub fn decrypt_str(
        &self,
        tenant_id: Uuid,
        ciphertext: &str,
        iv: &str,
        key_version: u32,
    ) -> Result<String, CryptoError> {
        let raw = self.decrypt(tenant_id, ciphertext, iv, key_version)?;
        String::from_utf8(raw).map_err(|_| CryptoError::Decrypt)
    }
}

/// Accepts a 32-byte key as base64 (standard) or 64 hex chars.
fn decode_master_key(s: &str) -> Result<[u8; 32], CryptoError> {
    let s = s.trim();
    let raw = if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(s).map_err(|e| CryptoError::InvalidMasterKey(e.to_string()))?
    } else {
        B64.decode(s)
            .map_err(|e| CryptoError::InvalidMasterKey(e.to_string()))?
    };
    raw.try_into()
        .map_err(|v: Vec<u8>| CryptoError::InvalidMasterKey(format!("need 32 bytes, got {}", v.len())))
}
