//! Session cookie assembly and request URL helpers

use axum::http::{header, HeaderMap};
use cookie::{Cookie, SameSite};

/// Effective request scheme, honoring `X-Forwarded-Proto`
pub fn forwarded_proto(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim())
        .unwrap_or("http")
}

/// Whether session cookies must carry the `Secure` attribute
pub fn is_secure(headers: &HeaderMap) -> bool {
    forwarded_proto(headers).eq_ignore_ascii_case("https")
}

/// Absolute base URL of the request (`scheme://host`)
pub fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}", forwarded_proto(headers), host)
}

/// Build the session cookie carrying the local token
pub fn session_cookie(
    name: &str,
    token: &str,
    secure: bool,
    max_age_secs: i64,
) -> Cookie<'static> {
    Cookie::build((name.to_string(), token.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(cookie::time::Duration::seconds(max_age_secs))
        .build()
}

/// Build the removal cookie clearing a session
pub fn clear_session_cookie(name: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), String::new()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

/// Validate a post-login/logout return target: local absolute paths only
pub fn validate_return(target: &str) -> Option<&str> {
    if target.starts_with('/') && !target.starts_with("//") {
        Some(target)
    } else {
        None
    }
}

/// Derive a local return path from a `Referer` header
pub fn referer_path(headers: &HeaderMap) -> Option<String> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    let after_scheme = referer.split_once("://").map(|(_, rest)| rest)?;
    let path = after_scheme.find('/').map(|i| &after_scheme[i..])?;
    validate_return(path).map(str::to_string)
}
