//! # Security Context
//!
//! Sits between the wire codec and the transport: derives symmetric keys
//! from a shared passphrase, or wraps a stream in certificate-based TLS
//! trust.
//!
//! ## Modes
//! - **None**: plaintext pass-through, the default
//! - **Symmetric**: XChaCha20-Poly1305 per-message AEAD keyed from a shared
//!   passphrase; `Low` effort runs one key-derivation pass, `High` adds a
//!   strengthening pass against weak passphrases at extra CPU cost
//! - **Asymmetric**: TLS with explicitly provided certificate material; a
//!   configured peer name must match or the handshake fails closed
//!
//! Key material is zeroized once the cipher is constructed.

pub mod symmetric;
pub mod tls;

use serde::{Deserialize, Serialize};

pub use symmetric::SymmetricCipher;
pub use tls::SecureStream;

/// Derived symmetric key width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyBits {
    K128,
    K256,
}

/// Key-derivation effort: `High` adds one strengthening pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum DerivationEffort {
    Low,
    High,
}

/// Where certificate/key material comes from.
///
/// OS certificate-store lookups live outside this crate; callers that use a
/// store resolve the material to bytes first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum CertificateSource {
    /// PEM files on disk
    PemFile {
        cert_path: String,
        key_path: Option<String>,
    },
    /// PEM material already in memory
    PemBytes {
        cert: Vec<u8>,
        key: Option<Vec<u8>>,
    },
}

/// Security settings for one session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum SecuritySpec {
    /// Plaintext, the default
    #[default]
    None,

    /// Passphrase-derived symmetric encryption
    Symmetric {
        passphrase: String,
        key_bits: KeyBits,
        effort: DerivationEffort,
    },

    /// Certificate-based TLS
    Asymmetric {
        /// Our own certificate + private key (required to accept connections)
        identity: Option<CertificateSource>,
        /// The peer/CA certificate we trust (required to originate connections)
        peer_trust: Option<CertificateSource>,
        /// When set, the peer's certificate must verify for exactly this name
        expected_peer_name: Option<String>,
    },
}

impl SecuritySpec {
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, SecuritySpec::Asymmetric { .. })
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, SecuritySpec::Symmetric { .. })
    }

    /// Validate security configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self {
            SecuritySpec::None => {}
            SecuritySpec::Symmetric { passphrase, .. } => {
                if passphrase.is_empty() {
                    errors.push("Symmetric security requires a non-empty passphrase".to_string());
                }
            }
            SecuritySpec::Asymmetric {
                identity,
                peer_trust,
                ..
            } => {
                if identity.is_none() && peer_trust.is_none() {
                    errors.push(
                        "Asymmetric security requires an identity or a trusted peer certificate"
                            .to_string(),
                    );
                }
            }
        }

        errors
    }

    /// Build the per-message cipher for symmetric modes, `None` otherwise.
    pub fn message_cipher(&self) -> crate::error::Result<Option<SymmetricCipher>> {
        match self {
            SecuritySpec::Symmetric {
                passphrase,
                key_bits,
                effort,
            } => Ok(Some(SymmetricCipher::from_passphrase(
                passphrase, *key_bits, *effort,
            ))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_passphrase_rejected() {
        let spec = SecuritySpec::Symmetric {
            passphrase: String::new(),
            key_bits: KeyBits::K256,
            effort: DerivationEffort::Low,
        };
        assert!(!spec.validate().is_empty());
    }

    #[test]
    fn asymmetric_needs_some_material() {
        let spec = SecuritySpec::Asymmetric {
            identity: None,
            peer_trust: None,
            expected_peer_name: Some("peer".into()),
        };
        assert!(!spec.validate().is_empty());
    }

    #[test]
    fn default_is_plaintext() {
        let spec = SecuritySpec::default();
        assert!(spec.validate().is_empty());
        assert!(!spec.is_symmetric());
        assert!(!spec.is_asymmetric());
    }
}
