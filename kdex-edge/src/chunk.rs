//! Split-cookie encryption
//!
//! Values larger than a browser's per-cookie limit are AES-256-GCM
//! encrypted, base64-encoded, and split across numbered cookies
//! `<name>_0`, `<name>_1`, …. Writes first delete any dangling indices left
//! over from a previously larger chunk set; reads walk indices from zero
//! until the first gap.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cookie::{Cookie, SameSite};
use once_cell::sync::OnceCell;
use rand::RngCore;

use crate::config::ChunkerConfig;
use crate::error::{Error, Result};

/// Per-cookie payload size in bytes of encoded material
pub const CHUNK_SIZE: usize = 3000;

const NONCE_LEN: usize = 12;

/// AES-256-GCM split-cookie codec
pub struct CookieChunker {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CookieChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieChunker").finish_non_exhaustive()
    }
}

impl CookieChunker {
    /// Build from a raw 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from configuration; generates a process-wide key when none is
    /// configured (encrypted values then do not survive a restart)
    pub fn from_config(config: &ChunkerConfig) -> Result<Self> {
        let key = match &config.key {
            Some(encoded) => {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::Crypto(format!("chunker key is not valid base64: {e}")))?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| {
                    Error::Crypto("chunker key must decode to exactly 32 bytes".into())
                })?;
                key
            }
            None => *process_key(),
        };
        Ok(Self::new(&key))
    }

    /// Encrypt and encode a value: base64(`nonce ∥ ciphertext ∥ tag`)
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("cookie encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decode and decrypt a sealed value
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let blob = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("sealed cookie is not valid base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed cookie shorter than its nonce".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("cookie decryption failed".into()))
    }

    /// Seal a value and split it into chunk cookies, prefixed by deletions
    /// for any indices the incoming request carries beyond the new count
    pub fn write_chunks(
        &self,
        name: &str,
        plaintext: &[u8],
        incoming: &HeaderMap,
        secure: bool,
        max_age_secs: i64,
    ) -> Result<Vec<Cookie<'static>>> {
        let sealed = self.seal(plaintext)?;
        let chunks: Vec<&str> = sealed
            .as_bytes()
            .chunks(CHUNK_SIZE)
            // sealed is base64, chunk boundaries always fall on char bounds
            .map(|c| std::str::from_utf8(c).expect("base64 is ascii"))
            .collect();

        let mut cookies = Vec::new();

        // Delete indices a prior, larger chunk set would leave dangling.
        let mut stale = chunks.len();
        while request_cookie(incoming, &chunk_name(name, stale)).is_some() {
            cookies.push(removal_cookie(chunk_name(name, stale), secure));
            stale += 1;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            cookies.push(chunk_cookie(
                chunk_name(name, i),
                (*chunk).to_string(),
                secure,
                max_age_secs,
            ));
        }
        Ok(cookies)
    }

    /// Reassemble chunk cookies from a request and decrypt the value
    pub fn read_chunks(&self, name: &str, incoming: &HeaderMap) -> Result<Vec<u8>> {
        let mut sealed = String::new();
        let mut index = 0;
        while let Some(chunk) = request_cookie(incoming, &chunk_name(name, index)) {
            sealed.push_str(&chunk);
            index += 1;
        }
        if index == 0 {
            return Err(Error::NotFound(format!("no '{name}' cookie chunks present")));
        }
        self.open(&sealed)
    }
}

/// Removal cookies for every chunk index the incoming request carries
pub fn removal_chunks(name: &str, incoming: &HeaderMap, secure: bool) -> Vec<Cookie<'static>> {
    let mut cookies = Vec::new();
    let mut index = 0;
    while request_cookie(incoming, &chunk_name(name, index)).is_some() {
        cookies.push(removal_cookie(chunk_name(name, index), secure));
        index += 1;
    }
    cookies
}

/// Name of chunk `i`
fn chunk_name(name: &str, i: usize) -> String {
    format!("{name}_{i}")
}

fn chunk_cookie(name: String, value: String, secure: bool, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(cookie::time::Duration::seconds(max_age_secs))
        .build()
}

fn removal_cookie(name: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, String::new()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

/// Look up a cookie value across all `Cookie` headers of a request
pub fn request_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for cookie in Cookie::split_parse(raw.to_string()).flatten() {
            if cookie.name() == name {
                return Some(cookie.value().to_string());
            }
        }
    }
    None
}

/// Process-wide fallback chunker key, generated at most once
fn process_key() -> &'static [u8; 32] {
    static KEY: OnceCell<[u8; 32]> = OnceCell::new();
    KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        tracing::warn!(
            "no chunker key configured; generated an ephemeral key, encrypted cookies will not survive a restart"
        );
        key
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn chunker() -> CookieChunker {
        CookieChunker::new(&[7u8; 32])
    }

    fn headers_with_cookies(cookies: &[(String, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = cookies
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(header::COOKIE, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn test_seal_open_round_trip() {
        let c = chunker();
        let sealed = c.seal(b"id-token-payload").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"id-token-payload");
    }

    #[test]
    fn test_nonce_freshness() {
        let c = chunker();
        assert_ne!(c.seal(b"same").unwrap(), c.seal(b"same").unwrap());
    }

    #[test]
    fn test_open_rejects_short_blob() {
        let c = chunker();
        let short = STANDARD.encode([0u8; NONCE_LEN]);
        assert!(c.open(&short).is_err());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let c = chunker();
        assert!(c.open("not-base64!!!").is_err());
        let tampered = STANDARD.encode([0u8; 64]);
        assert!(c.open(&tampered).is_err());
    }

    #[test]
    fn test_write_read_round_trip_multi_chunk() {
        let c = chunker();
        let value = vec![42u8; 5000];
        let cookies = c
            .write_chunks("oidc_hint", &value, &HeaderMap::new(), false, 3600)
            .unwrap();
        // 5000 bytes encrypts+encodes to > 2 chunks worth of base64
        assert!(cookies.len() >= 2, "expected multiple chunks");
        assert_eq!(cookies[0].name(), "oidc_hint_0");

        let incoming = headers_with_cookies(
            &cookies
                .iter()
                .map(|c| (c.name().to_string(), c.value().to_string()))
                .collect::<Vec<_>>(),
        );
        assert_eq!(c.read_chunks("oidc_hint", &incoming).unwrap(), value);
    }

    #[test]
    fn test_shrinking_chunk_count_deletes_dangling_indices() {
        let c = chunker();

        // Prior write left three chunks; the new value fits in one.
        let incoming = headers_with_cookies(&[
            ("oidc_hint_0".to_string(), "a".to_string()),
            ("oidc_hint_1".to_string(), "b".to_string()),
            ("oidc_hint_2".to_string(), "c".to_string()),
        ]);
        let cookies = c
            .write_chunks("oidc_hint", b"small", &incoming, false, 3600)
            .unwrap();

        let removals: Vec<&Cookie<'_>> = cookies
            .iter()
            .filter(|c| c.max_age() == Some(cookie::time::Duration::ZERO))
            .collect();
        let removal_names: Vec<&str> = removals.iter().map(|c| c.name()).collect();
        assert_eq!(removal_names, vec!["oidc_hint_1", "oidc_hint_2"]);

        let written: Vec<&str> = cookies
            .iter()
            .filter(|c| c.max_age() != Some(cookie::time::Duration::ZERO))
            .map(|c| c.name())
            .collect();
        assert_eq!(written, vec!["oidc_hint_0"]);
    }

    #[test]
    fn test_read_with_missing_first_chunk_fails() {
        let c = chunker();
        let incoming = headers_with_cookies(&[("oidc_hint_1".to_string(), "b".to_string())]);
        assert!(c.read_chunks("oidc_hint", &incoming).is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let c = chunker();
        let cookies = c
            .write_chunks("oidc_hint", b"v", &HeaderMap::new(), true, 3600)
            .unwrap();
        let cookie = &cookies[0];
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(
            cookie.max_age(),
            Some(cookie::time::Duration::seconds(3600))
        );
    }

    #[test]
    fn test_from_config_with_bad_key() {
        let config = ChunkerConfig {
            key: Some("too-short".to_string()),
            hint_ttl_secs: 3600,
        };
        assert!(CookieChunker::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_with_explicit_key() {
        let config = ChunkerConfig {
            key: Some(STANDARD.encode([9u8; 32])),
            hint_ttl_secs: 3600,
        };
        let c = CookieChunker::from_config(&config).unwrap();
        let sealed = c.seal(b"x").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"x");
    }
}
