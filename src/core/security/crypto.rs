//! Password-derived key material, chunk encryption, and challenge MACs.
//!
//! All cryptography in the session reduces to a single 256-bit key derived
//! from the shared password with PBKDF2-HMAC-SHA-256 (100 000 iterations,
//! fixed domain-separation salt). The same key feeds both the AES-256-GCM
//! chunk cipher and the HMAC-SHA-256 challenge signatures.
//!
//! Chunk wire layout: `IV (12 bytes) ‖ AES-256-GCM(plaintext)` with a
//! 128-bit tag. A fresh random IV per chunk avoids nonce reuse across the
//! session and across retries, and lets the receiver authenticate each
//! segment independently.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::core::config::{KDF_ITERATIONS, KDF_SALT};

type HmacSha256 = Hmac<Sha256>;

/// IV length for AES-GCM (96 bits).
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length (128 bits).
pub const TAG_LEN: usize = 16;

// ── Key derivation ───────────────────────────────────────────────────────────

/// Derive the 256-bit session key from a password.
pub fn derive_key(password: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    key
}

// ── Chunk cipher (hot path) ──────────────────────────────────────────────────

/// A chunk cipher bound to one password.
///
/// Key derivation is expensive (100k PBKDF2 rounds), so transfer loops hold
/// one of these and re-derive only when the password cell actually changes.
pub struct ChunkCipher {
    password: String,
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    pub fn new(password: &str) -> Result<Self> {
        let key = derive_key(password);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("failed to init AES cipher: {}", e))?;
        Ok(Self {
            password: password.to_owned(),
            cipher,
        })
    }

    /// True if this cipher was derived from `password`.
    pub fn matches(&self, password: &str) -> bool {
        self.password == password
    }

    /// Encrypt one chunk: fresh random IV, output `IV ‖ ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv: [u8; IV_LEN] = rand::random();
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow!("encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one chunk laid out as `IV ‖ ciphertext+tag`.
    ///
    /// Any authentication error is fatal for the transfer; callers map it
    /// to the `decryption-failed` error kind.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(anyhow!("ciphertext too short"));
        }
        let nonce = Nonce::from_slice(&data[..IV_LEN]);
        self.cipher
            .decrypt(nonce, &data[IV_LEN..])
            .map_err(|e| anyhow!("decryption failed: {}", e))
    }
}

// ── One-shot helpers ─────────────────────────────────────────────────────────

/// Encrypt a single chunk under `password` (derives the key per call).
pub fn encrypt_chunk(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    ChunkCipher::new(password)?.encrypt(plaintext)
}

/// Decrypt a single chunk under `password` (derives the key per call).
pub fn decrypt_chunk(ciphertext: &[u8], password: &str) -> Result<Vec<u8>> {
    ChunkCipher::new(password)?.decrypt(ciphertext)
}

// ── Challenge MACs ───────────────────────────────────────────────────────────

/// HMAC-SHA-256 over `nonce` under the password-derived key.
pub fn sign_challenge(nonce: &[u8], password: &str) -> [u8; 32] {
    let key = derive_key(password);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().into()
}

/// Verify a challenge MAC in constant time. Never short-circuits.
pub fn verify_challenge(nonce: &[u8], signature: &[u8], password: &str) -> bool {
    let key = derive_key(password);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.verify_slice(signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let plaintext = b"Hello, DropSync! This is a test chunk.";
        let encrypted = encrypt_chunk(plaintext, "secret").expect("encrypt");

        // IV + ciphertext + tag
        assert_eq!(encrypted.len(), IV_LEN + plaintext.len() + TAG_LEN);

        let decrypted = decrypt_chunk(&encrypted, "secret").expect("decrypt");
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn roundtrip_empty_plaintext() {
        let encrypted = encrypt_chunk(b"", "secret").expect("encrypt");
        assert_eq!(encrypted.len(), IV_LEN + TAG_LEN);
        let decrypted = decrypt_chunk(&encrypted, "secret").expect("decrypt");
        assert!(decrypted.is_empty());
    }

    #[test]
    fn wrong_password_fails() {
        let encrypted = encrypt_chunk(b"payload", "alpha").expect("encrypt");
        assert!(decrypt_chunk(&encrypted, "beta").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut encrypted = encrypt_chunk(b"payload", "secret").expect("encrypt");
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(decrypt_chunk(&encrypted, "secret").is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let encrypted = encrypt_chunk(b"payload", "secret").expect("encrypt");
        assert!(decrypt_chunk(&encrypted[..IV_LEN + 3], "secret").is_err());
        assert!(decrypt_chunk(&encrypted[..4], "secret").is_err());
    }

    #[test]
    fn iv_is_fresh_per_chunk() {
        let a = encrypt_chunk(b"same plaintext", "secret").expect("encrypt");
        let b = encrypt_chunk(b"same plaintext", "secret").expect("encrypt");
        assert_ne!(&a[..IV_LEN], &b[..IV_LEN], "IVs must not repeat");
        assert_ne!(a, b);
    }

    #[test]
    fn cipher_reuse_matches_one_shot() {
        let cipher = ChunkCipher::new("secret").expect("cipher");
        assert!(cipher.matches("secret"));
        assert!(!cipher.matches("other"));

        let encrypted = cipher.encrypt(b"chunk data").expect("encrypt");
        let decrypted = decrypt_chunk(&encrypted, "secret").expect("decrypt");
        assert_eq!(&decrypted[..], b"chunk data");
    }

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(derive_key("pw"), derive_key("pw"));
        assert_ne!(derive_key("pw"), derive_key("pw2"));
    }

    #[test]
    fn sign_verify_truth_table() {
        let nonce: [u8; 32] = rand::random();
        let mac = sign_challenge(&nonce, "secret");

        assert!(verify_challenge(&nonce, &mac, "secret"));
        assert!(!verify_challenge(&nonce, &mac, "other"));

        let other_mac = sign_challenge(&nonce, "other");
        assert!(!verify_challenge(&nonce, &other_mac, "secret"));

        let mut tampered = mac;
        tampered[0] ^= 0x01;
        assert!(!verify_challenge(&nonce, &tampered, "secret"));
    }

    #[test]
    fn signature_binds_to_nonce() {
        let mac = sign_challenge(b"nonce-a", "secret");
        assert!(!verify_challenge(b"nonce-b", &mac, "secret"));
    }
}
