//! # depot-security — the stateless auth core
//!
//! Three concerns, no server state:
//!
//! - [`TokenService`]: HS256 bearer tokens carrying
//!   `(sub, username, isRoot, exp)`; no revocation list.
//! - [`hash_password`] / [`verify_password`]: argon2id with per-hash salts
//!   and constant-time verification.
//! - [`verify_master_key`]: constant-time comparison of the administrative
//!   master key; a match elevates a request to root regardless of token.

mod password;
mod token;

pub use password::{hash_password, verify_password};
pub use token::{Claims, TokenService};

use subtle::ConstantTimeEq;

/// Errors raised by the auth core.
#[derive(Debug)]
pub enum SecurityError {
    /// The token is malformed or its signature does not verify.
    InvalidToken(String),
    /// The token is valid but expired.
    TokenExpired,
    /// Password hashing or verification failed structurally.
    Hash(String),
}

impl std::fmt::Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityError::InvalidToken(msg) => write!(f, "invalid token: {msg}"),
            SecurityError::TokenExpired => write!(f, "token expired"),
            SecurityError::Hash(msg) => write!(f, "hash error: {msg}"),
        }
    }
}

impl std::error::Error for SecurityError {}

impl SecurityError {
    /// What the HTTP surface may say; details stay in logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            SecurityError::TokenExpired => "token expired",
            _ => "unauthorized",
        }
    }
}

/// Constant-time master-key comparison. Length differences short-circuit,
/// which leaks only the length, not the contents.
pub fn verify_master_key(configured: &str, presented: &str) -> bool {
    if configured.len() < 96 {
        // A key this short was never valid configuration.
        return false;
    }
    configured
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .unwrap_u8()
        == 1
}
