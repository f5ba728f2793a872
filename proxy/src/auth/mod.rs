//! Authentication module.
//!
//! Key material loading, token verification, and the authorization gate that
//! every non-health request passes through.
//!
//! # Post-conditions
//! - Key material and gate settings are immutable once loaded.
//!
//! # Invariants
//! - Claims are computed per request and never cached.

pub mod gate;
pub mod jwt;
pub mod key_material;

pub use gate::{AuthGate, HttpDecision, UpgradeDecision};
pub use jwt::{Claims, JwtError, verify_token};
pub use key_material::{KeyKind, KeyLoadError, KeyMaterial};
