//! Passphrase-keyed symmetric encryption.
//!
//! Key derivation is deterministic — both peers run the same salted,
//! iterated SHA-256 over the shared passphrase, so no negotiation round-trip
//! is needed before encrypted traffic can flow. The derivation constants
//! below are the protocol contract; changing them is a wire break.
//!
//! Each message travels as `[24-byte nonce][AEAD ciphertext]` under
//! XChaCha20-Poly1305. A 128-bit strength setting bounds the derived
//! entropy, not the cipher key width: the 16 derived bytes are expanded to
//! the cipher's 32-byte key through one labeled hash.

use crate::error::{constants, CommError, Result};
use crate::security::{DerivationEffort, KeyBits};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use tracing::instrument;
use zeroize::Zeroize;

/// Iterations per derivation pass
const PASS_ROUNDS: u32 = 4096;

/// Fixed derivation salt; both peers must agree on it byte-for-byte
const KDF_SALT: &[u8] = b"peerlink.kdf.v1";

/// Domain label for the High-effort strengthening pass
const STRENGTHEN_LABEL: &[u8] = b"peerlink.kdf.strengthen";

/// Domain label for expanding a 128-bit key to the cipher width
const EXPAND_LABEL: &[u8] = b"peerlink.kdf.expand128";

/// Nonce width of XChaCha20-Poly1305
pub const NONCE_LEN: usize = 24;

/// One salted, iterated-SHA-256 pass over the input material
fn derivation_pass(input: &[u8], label: &[u8]) -> [u8; 32] {
    let mut state: [u8; 32] = {
        let mut hasher = Sha256::new();
        hasher.update(KDF_SALT);
        hasher.update(label);
        hasher.update(input);
        hasher.finalize().into()
    };

    for _ in 1..PASS_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(KDF_SALT);
        hasher.update(state);
        state = hasher.finalize().into();
    }

    state
}

/// Derive the 32-byte cipher key from a shared passphrase.
///
/// `Low` runs a single pass; `High` runs a second strengthening pass over
/// the first pass's output. `K128` truncates the derived material to 16
/// bytes of entropy before expanding back to the cipher width.
pub fn derive_key(passphrase: &str, key_bits: KeyBits, effort: DerivationEffort) -> [u8; 32] {
    let mut derived = derivation_pass(passphrase.as_bytes(), b"");

    if effort == DerivationEffort::High {
        let strengthened = derivation_pass(&derived, STRENGTHEN_LABEL);
        derived.zeroize();
        derived = strengthened;
    }

    match key_bits {
        KeyBits::K256 => derived,
        KeyBits::K128 => {
            let mut hasher = Sha256::new();
            hasher.update(EXPAND_LABEL);
            hasher.update(&derived[..16]);
            let expanded: [u8; 32] = hasher.finalize().into();
            derived.zeroize();
            expanded
        }
    }
}

/// Per-message AEAD cipher shared by a session's loops
pub struct SymmetricCipher {
    cipher: XChaCha20Poly1305,
}

impl SymmetricCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Derive the key and construct the cipher, zeroizing the key afterwards
    pub fn from_passphrase(passphrase: &str, key_bits: KeyBits, effort: DerivationEffort) -> Self {
        let mut key = derive_key(passphrase, key_bits, effort);
        let cipher = Self::new(&key);
        key.zeroize();
        cipher
    }

    /// Generate a random nonce for one message
    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| CommError::Security(format!("Nonce generation failed: {e}")))?;
        Ok(nonce)
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CommError::Security(constants::ERR_ENCRYPTION_FAILED.into()))
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CommError::Security(constants::ERR_DECRYPTION_FAILED.into()))
    }

    /// Encrypt and prepend the nonce: the on-wire form of one message
    #[instrument(skip(self, plaintext), level = "trace")]
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt(plaintext, &nonce)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);

        nonce.zeroize();
        Ok(out)
    }

    /// Split off the nonce and decrypt: the inverse of `seal`
    #[instrument(skip(self, payload), level = "trace")]
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(CommError::Security(constants::ERR_DECRYPTION_FAILED.into()));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let plaintext = self.decrypt(ciphertext, &nonce)?;
        nonce.zeroize();
        Ok(plaintext)
    }
}
