//! Local and OIDC authentication exchange
//!
//! Local tokens are JWTs signed by the host's active key pair. The
//! authorization endpoint issues short-lived one-time codes; the token
//! endpoint exchanges codes or password credentials for local tokens; the
//! OIDC callback exchanges a provider code for an ID token and mints a
//! local session.

pub mod code;
pub mod oidc;
pub mod session;
pub mod token;

pub use code::{AuthCodeRecord, AuthCodeStore, CODE_TTL};
pub use oidc::{unverified_claims, OidcProvider, StandardOidcProvider};
pub use session::{base_url, clear_session_cookie, is_secure, session_cookie, validate_return};
pub use token::{issue, verify, LocalClaims, PROXY_ASSERTION_TTL};

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};

use crate::decl::LocalAccount;
use crate::error::{Error, Result};
use crate::identity::{AuthMethod, Identity};

/// Verify a local account's password against its stored Argon2 PHC hash
pub fn verify_password(account: &LocalAccount, password: &str) -> Result<bool> {
    let parsed = PasswordHash::new(&account.password_hash)
        .map_err(|e| Error::Internal(format!("stored password hash is malformed: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Build an identity for a successfully authenticated local account
pub fn account_identity(account: &LocalAccount, method: AuthMethod) -> Identity {
    Identity {
        subject: account.username.clone(),
        claims: account.claims.clone(),
        scopes: Vec::new(),
        method,
    }
}
