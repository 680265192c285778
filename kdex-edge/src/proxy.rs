//! Reverse proxy to backend functions
//!
//! Requests are rewritten by a pipeline of pure steps: target scheme/host,
//! joined path, verbatim query, stripped cookies, a short-lived signed
//! assertion carrying the caller's mapped claims, and standard forwarding
//! headers. Upstream `Set-Cookie` headers lose any `Domain` attribute so
//! cookies bind to the edge domain.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;

use crate::auth::token::{issue, PROXY_ASSERTION_TTL};
use crate::config::ProxyConfig;
use crate::decl::ClaimMappings;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::keys::KeySet;
use crate::table::FunctionRoute;

/// Marker header set on every forwarded request
pub const FORWARDED_HEADER: &str = "x-kdex-forwarded";

/// Shared upstream HTTP client with the edge transport defaults
pub struct ProxyClient {
    client: reqwest::Client,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient").finish_non_exhaustive()
    }
}

impl ProxyClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_keepalive(Some(config.keepalive()))
            .read_timeout(config.read_timeout())
            .pool_idle_timeout(Some(config.idle_timeout()))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build proxy client: {e}")))?;
        Ok(Self { client })
    }

    /// Forward a request to a function's upstream and relay the response
    pub async fn forward(
        &self,
        route: &FunctionRoute,
        keys: &KeySet,
        identity: Option<&Identity>,
        req: Request,
    ) -> Result<Response> {
        let (parts, body) = req.into_parts();

        let mut url = route.upstream.clone();
        url.set_path(&path_join(route.upstream.path(), parts.uri.path()));
        url.set_query(parts.uri.query());

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            if is_dropped_request_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(identity) = identity {
            let assertion = forwarded_assertion(keys, route, identity, &parts.headers)?;
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {assertion}"))
                    .map_err(|e| Error::Internal(format!("assertion not header-safe: {e}")))?,
            );
        }

        headers.insert(FORWARDED_HEADER, HeaderValue::from_static("true"));
        // A fronting proxy's X-Forwarded-* values win; only synthesize what
        // the inbound request did not already carry.
        if !parts.headers.contains_key("x-forwarded-host") {
            if let Some(host) = parts.headers.get(header::HOST) {
                headers.insert("x-forwarded-host", host.clone());
            }
        }
        if !parts.headers.contains_key("x-forwarded-proto") {
            headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }
        let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>();
        if let Some(chain) = forwarded_for_chain(&parts.headers, peer) {
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert("x-forwarded-for", value);
            }
        }

        let upstream_response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| map_transport_error(&route.name, &e))?;

        relay_response(upstream_response)
    }
}

fn map_transport_error(function: &str, error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::UpstreamTimeout(format!("function '{function}' timed out: {error}"))
    } else {
        Error::Upstream(format!("function '{function}' unreachable: {error}"))
    }
}

fn relay_response(upstream: reqwest::Response) -> Result<Response> {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);

    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_dropped_response_header(name.as_str()) {
                continue;
            }
            if name == header::SET_COOKIE {
                if let Ok(raw) = value.to_str() {
                    let stripped = strip_cookie_domain(raw);
                    if let Ok(rebuilt) = HeaderValue::from_str(&stripped) {
                        response_headers.append(header::SET_COOKIE, rebuilt);
                        continue;
                    }
                }
            }
            response_headers.append(name.clone(), value.clone());
        }
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(format!("failed to assemble proxied response: {e}")))
}

/// Join the upstream base path with the inbound path, preserving the
/// inbound trailing slash
pub fn path_join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path == "/" {
        return format!("{base}/");
    }
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{base}{path}")
}

/// Hop-by-hop and edge-private request headers never forwarded upstream
fn is_dropped_request_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "cookie"
            | "authorization"
            | "content-length"
    )
}

fn is_dropped_response_header(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
    )
}

/// Extend the `X-Forwarded-For` chain with the connecting peer
///
/// The peer address comes from the listener's `ConnectInfo` extension.
/// Without one, an inbound chain forwards unchanged through the header
/// copy and `None` is returned.
fn forwarded_for_chain(
    inbound: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
) -> Option<String> {
    let ConnectInfo(addr) = peer?;
    let existing = inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    Some(match existing {
        Some(chain) => format!("{chain}, {}", addr.ip()),
        None => addr.ip().to_string(),
    })
}

/// Remove any `Domain` attribute from a `Set-Cookie` value
pub fn strip_cookie_domain(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .map(str::trim)
        .filter(|part| !part.to_ascii_lowercase().starts_with("domain="))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Apply claim renames; unmapped claims pass through under their own name
pub fn mapped_claims(mappings: &ClaimMappings, identity: &Identity) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in &identity.claims {
        let target = mappings.0.get(name).cloned().unwrap_or_else(|| name.clone());
        out.insert(target, value.clone());
    }
    out
}

/// Mint the short-lived signed assertion forwarded to the upstream:
/// mapped claims plus the inbound cookie and header sets
fn forwarded_assertion(
    keys: &KeySet,
    route: &FunctionRoute,
    identity: &Identity,
    inbound: &HeaderMap,
) -> Result<String> {
    let mut extra = mapped_claims(&route.claim_mappings, identity);

    let mut cookies = Map::new();
    if let Some(raw) = inbound.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for cookie in cookie::Cookie::split_parse(raw.to_string()).flatten() {
            cookies.insert(cookie.name().to_string(), json!(cookie.value()));
        }
    }
    extra.insert("cookies".into(), Value::Object(cookies));

    let mut header_sets = Map::new();
    for (name, value) in inbound {
        if name == header::COOKIE || name == header::AUTHORIZATION {
            continue;
        }
        if let Ok(value) = value.to_str() {
            header_sets.insert(name.as_str().to_string(), json!(value));
        }
    }
    extra.insert("headers".into(), Value::Object(header_sets));

    issue(
        keys,
        &identity.subject,
        &identity.scopes,
        identity.method,
        extra,
        PROXY_ASSERTION_TTL,
    )
}
