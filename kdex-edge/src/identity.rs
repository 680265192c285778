//! Per-request identity context
//!
//! The auth middleware populates an [`Identity`] request extension from the
//! session cookie or a bearer token. Absence of the extension means the
//! caller is anonymous; presence implies the token's signature verified and
//! the token had not expired.

use serde_json::{Map, Value};

/// How the caller's identity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Local username/password login
    Password,
    /// OIDC provider code exchange
    Oidc,
    /// Verified `Authorization: Bearer` token
    Bearer,
    /// Authorization-code grant at the token endpoint
    Code,
}

impl AuthMethod {
    /// Wire name used in the `amr` claim
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Password => "pwd",
            AuthMethod::Oidc => "oidc",
            AuthMethod::Bearer => "bearer",
            AuthMethod::Code => "code",
        }
    }

    /// Parse the wire name back; unknown values map to `Bearer`
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pwd" => AuthMethod::Password,
            "oidc" => AuthMethod::Oidc,
            "code" => AuthMethod::Code,
            _ => AuthMethod::Bearer,
        }
    }
}

/// Authenticated caller context flowing through the request
#[derive(Debug, Clone)]
pub struct Identity {
    /// Subject identifier
    pub subject: String,

    /// Verified claims
    pub claims: Map<String, Value>,

    /// Granted scopes
    pub scopes: Vec<String>,

    /// How the identity was established
    pub method: AuthMethod,
}

/// Cache-key hash shared by all anonymous callers
pub const ANONYMOUS_HASH: &str = "anon";

impl Identity {
    /// Deterministic short hash of the subject, used to partition cached
    /// renders per user
    pub fn user_hash(&self) -> String {
        let digest = blake3::hash(self.subject.as_bytes());
        digest.to_hex()[..16].to_string()
    }

    /// Whether the claims were obtained from a verified bearer JWT
    pub fn is_bearer(&self) -> bool {
        self.method == AuthMethod::Bearer
    }
}

/// Cache-key hash for an optional identity
pub fn user_hash(identity: Option<&Identity>) -> String {
    match identity {
        Some(identity) => identity.user_hash(),
        None => ANONYMOUS_HASH.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            claims: Map::new(),
            scopes: vec![],
            method: AuthMethod::Password,
        }
    }

    #[test]
    fn test_user_hash_is_deterministic() {
        let a = identity("alice");
        let b = identity("alice");
        assert_eq!(a.user_hash(), b.user_hash());
        assert_eq!(a.user_hash().len(), 16);
    }

    #[test]
    fn test_user_hash_differs_per_subject() {
        assert_ne!(identity("alice").user_hash(), identity("bob").user_hash());
    }

    #[test]
    fn test_anonymous_callers_share_one_hash() {
        assert_eq!(user_hash(None), ANONYMOUS_HASH);
    }

    #[test]
    fn test_auth_method_round_trip() {
        for method in [
            AuthMethod::Password,
            AuthMethod::Oidc,
            AuthMethod::Bearer,
            AuthMethod::Code,
        ] {
            assert_eq!(AuthMethod::from_str_lossy(method.as_str()), method);
        }
    }
}
