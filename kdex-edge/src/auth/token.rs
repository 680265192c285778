//! Local JWT issue and verification

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::{AuthMethod, Identity};
use crate::keys::KeySet;

/// Lifetime of the signed assertion forwarded to backend functions
pub const PROXY_ASSERTION_TTL: Duration = Duration::from_secs(5 * 60);

/// Claims carried by locally issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalClaims {
    /// Subject
    pub sub: String,

    /// Expiry (unix seconds)
    pub exp: i64,

    /// Issued-at (unix seconds)
    pub iat: i64,

    /// Space-delimited granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Authentication method reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amr: Option<String>,

    /// Additional identity claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocalClaims {
    /// Granted scopes as a list
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Issue a signed local token with the key set's active pair
pub fn issue(
    keys: &KeySet,
    subject: &str,
    scopes: &[String],
    method: AuthMethod,
    extra: Map<String, Value>,
    ttl: Duration,
) -> Result<String> {
    let pair = keys.active();
    let now = Utc::now().timestamp();
    let claims = LocalClaims {
        sub: subject.to_string(),
        exp: now + ttl.as_secs() as i64,
        iat: now,
        scope: if scopes.is_empty() {
            None
        } else {
            Some(scopes.join(" "))
        },
        amr: Some(method.as_str().to_string()),
        extra,
    };

    let mut header = Header::new(pair.alg);
    header.kid = Some(pair.kid.clone());
    Ok(encode(&header, &claims, &pair.encoding)?)
}

/// Verify a local token against the key set
///
/// The `kid` header selects the pair; tokens without one verify against the
/// active pair. Expired or mis-signed tokens are rejected.
pub fn verify(keys: &KeySet, token: &str) -> Result<LocalClaims> {
    let header = decode_header(token)?;
    let pair = match header.kid.as_deref() {
        Some(kid) => keys
            .find(kid)
            .ok_or_else(|| Error::Unauthorized(format!("unknown key id '{kid}'")))?,
        None => keys.active(),
    };

    let validation = Validation::new(pair.alg);
    let data = decode::<LocalClaims>(token, &pair.decoding, &validation)?;
    Ok(data.claims)
}

/// Build the request identity for verified claims
pub fn identity_from_claims(claims: LocalClaims, method_override: Option<AuthMethod>) -> Identity {
    let method = method_override.unwrap_or_else(|| {
        claims
            .amr
            .as_deref()
            .map(AuthMethod::from_str_lossy)
            .unwrap_or(AuthMethod::Bearer)
    });
    let scopes = claims.scopes();
    Identity {
        subject: claims.sub,
        claims: claims.extra,
        scopes,
        method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    fn keys() -> KeySet {
        KeySet::new(vec![KeyPair::from_hs256_secret(
            "test-key",
            b"0123456789abcdef0123456789abcdef",
        )])
    }

    #[test]
    fn test_issue_verify_round_trip() {
        let keys = keys();
        let mut extra = Map::new();
        extra.insert("email".into(), json!("ada@example.com"));
        let token = issue(
            &keys,
            "ada",
            &["read".into(), "write".into()],
            AuthMethod::Password,
            extra,
            Duration::from_secs(60),
        )
        .unwrap();

        let claims = verify(&keys, &token).unwrap();
        assert_eq!(claims.sub, "ada");
        assert_eq!(claims.scopes(), vec!["read", "write"]);
        assert_eq!(claims.amr.as_deref(), Some("pwd"));
        assert_eq!(claims.extra.get("email"), Some(&json!("ada@example.com")));
    }

    #[test]
    fn test_verify_rejects_foreign_signature() {
        let keys_a = keys();
        let keys_b = KeySet::new(vec![KeyPair::from_hs256_secret(
            "test-key",
            b"ffffffffffffffffffffffffffffffff",
        )]);
        let token = issue(
            &keys_a,
            "ada",
            &[],
            AuthMethod::Password,
            Map::new(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(verify(&keys_b, &token).is_err());
    }

    #[test]
    fn test_verify_rejects_unknown_kid() {
        let keys_a = keys();
        let keys_b = KeySet::new(vec![KeyPair::from_hs256_secret(
            "other-key",
            b"0123456789abcdef0123456789abcdef",
        )]);
        let token = issue(
            &keys_a,
            "ada",
            &[],
            AuthMethod::Password,
            Map::new(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(verify(&keys_b, &token).is_err());
    }

    #[test]
    fn test_identity_from_claims_uses_amr() {
        let keys = keys();
        let token = issue(
            &keys,
            "ada",
            &[],
            AuthMethod::Oidc,
            Map::new(),
            Duration::from_secs(60),
        )
        .unwrap();
        let identity = identity_from_claims(verify(&keys, &token).unwrap(), None);
        assert_eq!(identity.method, AuthMethod::Oidc);

        let identity = identity_from_claims(
            verify(&keys, &token).unwrap(),
            Some(AuthMethod::Bearer),
        );
        assert_eq!(identity.method, AuthMethod::Bearer);
    }
}
