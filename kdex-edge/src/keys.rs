//! Signing key material
//!
//! JWT signing/verification primitives come from `jsonwebtoken`; this module
//! only assembles key pairs into a per-host [`KeySet`] and derives the JWKS
//! document from the stored public JWKs. A dev-mode HS256 pair is generated
//! at most once per process behind an explicit initializer.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use once_cell::sync::OnceCell;
use rand::RngCore;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// One signing key pair with an optional publishable JWK
#[derive(Clone)]
pub struct KeyPair {
    /// Key id stamped into token headers
    pub kid: String,

    /// Signing algorithm
    pub alg: Algorithm,

    pub(crate) encoding: EncodingKey,
    pub(crate) decoding: DecodingKey,

    /// Public JWK served at `/.well-known/jwks.json`; symmetric keys carry
    /// none
    pub public_jwk: Option<Value>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Symmetric HS256 pair from a raw secret
    pub fn from_hs256_secret(kid: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            alg: Algorithm::HS256,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            public_jwk: None,
        }
    }

    /// RS256 pair from PEM-encoded keys plus the serialized public JWK
    pub fn from_rsa_pem(
        kid: impl Into<String>,
        private_pem: &[u8],
        public_pem: &[u8],
        public_jwk: Value,
    ) -> Result<Self> {
        let kid = kid.into();
        let encoding = EncodingKey::from_rsa_pem(private_pem)?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)?;
        let mut jwk = public_jwk;
        if let Some(obj) = jwk.as_object_mut() {
            obj.entry("kid").or_insert_with(|| json!(kid.clone()));
            obj.entry("alg").or_insert_with(|| json!("RS256"));
            obj.entry("use").or_insert_with(|| json!("sig"));
        }
        Ok(Self {
            kid,
            alg: Algorithm::RS256,
            encoding,
            decoding,
            public_jwk: Some(jwk),
        })
    }
}

/// The active signing keys of one host; the first pair signs, all pairs
/// verify
#[derive(Debug, Clone)]
pub struct KeySet {
    pairs: Vec<KeyPair>,
}

impl KeySet {
    /// Build a key set; falls back to the process dev pair when empty
    pub fn new(pairs: Vec<KeyPair>) -> Self {
        if pairs.is_empty() {
            Self {
                pairs: vec![dev_key_pair().clone()],
            }
        } else {
            Self { pairs }
        }
    }

    /// The pair used for signing
    pub fn active(&self) -> &KeyPair {
        // `new` guarantees at least one pair
        &self.pairs[0]
    }

    /// Find a pair by key id
    pub fn find(&self, kid: &str) -> Option<&KeyPair> {
        self.pairs.iter().find(|p| p.kid == kid)
    }

    /// All pairs, signing pair first
    pub fn pairs(&self) -> &[KeyPair] {
        &self.pairs
    }

    /// JSON Web Key Set of the publishable keys
    pub fn jwks(&self) -> Value {
        let keys: Vec<Value> = self
            .pairs
            .iter()
            .filter_map(|p| p.public_jwk.clone())
            .collect();
        json!({ "keys": keys })
    }

    /// Algorithms present in the set, deduplicated
    pub fn algorithms(&self) -> Vec<String> {
        let mut algs: Vec<String> = Vec::new();
        for pair in &self.pairs {
            let name = format!("{:?}", pair.alg);
            if !algs.contains(&name) {
                algs.push(name);
            }
        }
        algs
    }
}

impl Default for KeySet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Process-wide dev-mode HS256 pair, generated at most once
///
/// Intended for hosts registered without key material; tokens signed with it
/// do not survive a process restart.
pub fn dev_key_pair() -> &'static KeyPair {
    static DEV_PAIR: OnceCell<KeyPair> = OnceCell::new();
    DEV_PAIR.get_or_init(|| {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let kid = format!("dev-{}", URL_SAFE_NO_PAD.encode(&secret[..6]));
        tracing::warn!(kid = %kid, "no signing keys configured; generated dev-mode HS256 key");
        KeyPair::from_hs256_secret(kid, &secret)
    })
}

/// Reject obviously unusable key material early
pub fn validate_secret(secret: &[u8]) -> Result<()> {
    if secret.len() < 32 {
        return Err(Error::Crypto(format!(
            "signing secret too short: {} bytes, need at least 32",
            secret.len()
        )));
    }
    Ok(())
}
