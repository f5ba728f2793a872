//! Key material used to verify tokens.
//!
//! The key file is read once at startup and resolved through an ordered series
//! of parse attempts:
//! 1. A PEM block labelled `PUBLIC KEY` or `RSA PUBLIC KEY` is tried as RSA
//!    (SubjectPublicKeyInfo, then PKCS#1), EC, and Ed25519, first success wins.
//! 2. Anything else, including a public-key block none of the attempts accept,
//!    becomes a symmetric secret made of the whole file.
//!
//! # Post-conditions
//! - Loading only fails when the file cannot be read.
//! - The resolved [`KeyKind`] is always observable; a key that can never
//!   verify anything (an empty secret) is reported when loaded.
//!
//! # Invariants
//! - `KeyMaterial` is immutable and safe to share across tasks.

use std::path::{Path, PathBuf};

use jsonwebtoken::{Algorithm, DecodingKey};

use super::jwt::JwtError;

/// PEM labels that mark a public key.
const PUBLIC_KEY_LABELS: [&str; 2] = ["PUBLIC KEY", "RSA PUBLIC KEY"];

type ParseAttempt = fn(&[u8]) -> jsonwebtoken::errors::Result<DecodingKey>;

/// Asymmetric parse attempts, in order.
const PUBLIC_KEY_ATTEMPTS: [(KeyKind, ParseAttempt); 3] = [
    (KeyKind::Rsa, DecodingKey::from_rsa_pem),
    (KeyKind::Ec, DecodingKey::from_ec_pem),
    (KeyKind::Ed25519, DecodingKey::from_ed_pem),
];

/// Error returned when the key file cannot be read.
#[derive(Debug)]
pub struct KeyLoadError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for KeyLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to read key file {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for KeyLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Which kind of key the file resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec,
    Ed25519,
    Secret,
}

impl KeyKind {
    /// Token algorithms this kind of key may verify.
    ///
    /// Restricting the list per key kind keeps an HMAC token from being checked
    /// against a public key and vice versa.
    #[must_use]
    pub const fn algorithms(self) -> &'static [Algorithm] {
        match self {
            Self::Rsa => &[
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
            ],
            Self::Ec => &[Algorithm::ES256, Algorithm::ES384],
            Self::Ed25519 => &[Algorithm::EdDSA],
            Self::Secret => &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa => write!(f, "RSA public key"),
            Self::Ec => write!(f, "EC public key"),
            Self::Ed25519 => write!(f, "Ed25519 public key"),
            Self::Secret => write!(f, "symmetric secret"),
        }
    }
}

/// Verifiable key material.
#[derive(Clone)]
pub enum KeyMaterial {
    /// A parsed public key.
    Asymmetric {
        kind: KeyKind,
        key: DecodingKey,
    },
    /// Raw secret bytes for HMAC verification.
    SymmetricSecret {
        secret: Vec<u8>,
        key: DecodingKey,
    },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asymmetric { kind, .. } => {
                f.debug_struct("Asymmetric").field("kind", kind).finish()
            }
            Self::SymmetricSecret { secret, .. } => f
                .debug_struct("SymmetricSecret")
                .field("len", &secret.len())
                .finish(),
        }
    }
}

impl KeyMaterial {
    /// Read and resolve the key file at `path`.
    ///
    /// # Errors
    /// Returns `KeyLoadError` only if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, KeyLoadError> {
        let bytes = std::fs::read(path).map_err(|source| KeyLoadError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Resolve raw key file contents. Never fails.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match pem_label(&bytes) {
            Some(label) if PUBLIC_KEY_LABELS.contains(&label) => {
                if let Some(material) = parse_public_key(&bytes) {
                    return material;
                }
                tracing::warn!(
                    "key file holds a '{label}' block that no parser accepts; using it as a symmetric secret"
                );
            }
            Some(label) => {
                tracing::debug!("PEM block '{label}' is not a public key; using the file as a symmetric secret");
            }
            None => {}
        }
        Self::secret(bytes)
    }

    /// Build symmetric key material directly from secret bytes.
    #[must_use]
    pub fn secret(secret: Vec<u8>) -> Self {
        if secret.is_empty() {
            tracing::warn!("symmetric secret is empty; every token will be rejected");
        }
        let key = DecodingKey::from_secret(&secret);
        Self::SymmetricSecret { secret, key }
    }

    #[must_use]
    pub const fn kind(&self) -> KeyKind {
        match self {
            Self::Asymmetric { kind, .. } => *kind,
            Self::SymmetricSecret { .. } => KeyKind::Secret,
        }
    }

    /// The decoding key, or `InvalidKey` if this material cannot verify anything.
    pub(crate) fn decoding_key(&self) -> Result<&DecodingKey, JwtError> {
        match self {
            Self::Asymmetric { key, .. } => Ok(key),
            Self::SymmetricSecret { secret, .. } if secret.is_empty() => {
                Err(JwtError::InvalidKey("secret must be non-empty".to_string()))
            }
            Self::SymmetricSecret { key, .. } => Ok(key),
        }
    }
}

fn parse_public_key(pem: &[u8]) -> Option<KeyMaterial> {
    PUBLIC_KEY_ATTEMPTS.iter().find_map(|(kind, parse)| {
        parse(pem).ok().map(|key| KeyMaterial::Asymmetric { kind: *kind, key })
    })
}

/// Label of the first PEM block, if the contents contain one.
fn pem_label(bytes: &[u8]) -> Option<&str> {
    const BEGIN: &str = "-----BEGIN ";

    let text = std::str::from_utf8(bytes).ok()?;
    let start = text.find(BEGIN)? + BEGIN.len();
    let rest = &text[start..];
    let end = rest.find("-----")?;
    Some(&rest[..end])
}
