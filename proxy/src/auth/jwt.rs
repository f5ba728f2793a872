//! JWT verification module.
//!
//! Verifies JSON Web Tokens against the loaded [`KeyMaterial`] and returns the
//! identity claims they carry.
//!
//! # Pre-conditions
//! - The key material has been resolved at startup.
//!
//! # Post-conditions
//! - On success, returns the token's claims.
//! - On failure, returns a descriptive error; callers are free to treat every
//!   variant the same way.
//!
//! # Invariants
//! - Verification is stateless and does not modify any external state.
//! - `exp` and `nbf` are checked against the current time with no leeway when
//!   present; neither is required.

use jsonwebtoken::{Validation, decode};
use serde::{Deserialize, Serialize};

use super::KeyMaterial;

/// Claims extracted from a verified JWT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Application user identifier.
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    /// Subject claim, used when `userId` is empty.
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    /// The identity forwarded upstream: `userId`, or `sub` when `userId` is empty.
    #[must_use]
    pub fn identity_user_id(&self) -> &str {
        if self.user_id.is_empty() {
            &self.sub
        } else {
            &self.user_id
        }
    }
}

/// Error returned when JWT verification fails.
#[derive(Debug)]
pub enum JwtError {
    /// The JWT signature is invalid.
    InvalidSignature,
    /// The JWT has expired.
    TokenExpired,
    /// The JWT's `nbf` is in the future.
    TokenNotYetValid,
    /// The JWT is malformed, cannot be parsed, or uses an algorithm the key
    /// does not support.
    MalformedToken,
    /// The key material cannot verify tokens.
    InvalidKey(String),
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "invalid JWT signature"),
            Self::TokenExpired => write!(f, "JWT has expired"),
            Self::TokenNotYetValid => write!(f, "JWT is not valid yet"),
            Self::MalformedToken => write!(f, "malformed JWT"),
            Self::InvalidKey(reason) => write!(f, "invalid key: {reason}"),
        }
    }
}

impl std::error::Error for JwtError {}

/// Verifies a JWT and returns its claims.
///
/// # Arguments
/// * `token` - The JWT string to verify.
/// * `key` - The key material loaded at startup.
///
/// # Errors
/// Returns `JwtError` if verification fails for any reason.
pub fn verify_token(token: &str, key: &KeyMaterial) -> Result<Claims, JwtError> {
    let decoding_key = key.decoding_key()?;
    let validation = validation_for(key);

    decode::<Claims>(token, decoding_key, &validation)
        .map(|token_data| token_data.claims)
        .map_err(map_jwt_error)
}

fn validation_for(key: &KeyMaterial) -> Validation {
    let mut validation = Validation::default();
    validation.algorithms = key.kind().algorithms().to_vec();
    validation.required_spec_claims.clear();
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation
}

/// Maps jsonwebtoken errors to our `JwtError` type.
fn map_jwt_error(error: jsonwebtoken::errors::Error) -> JwtError {
    use jsonwebtoken::errors::ErrorKind;

    match error.kind() {
        ErrorKind::InvalidSignature => JwtError::InvalidSignature,
        ErrorKind::ExpiredSignature => JwtError::TokenExpired,
        ErrorKind::ImmatureSignature => JwtError::TokenNotYetValid,
        ErrorKind::InvalidKeyFormat => JwtError::InvalidKey(error.to_string()),
        _ => JwtError::MalformedToken,
    }
}
