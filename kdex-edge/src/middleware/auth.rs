//! Identity-populating middleware
//!
//! Resolves the caller's identity from `Authorization: Bearer` or the
//! session cookie and inserts it as a request extension. A missing or
//! failing credential yields an anonymous request here; only token
//! endpoints turn verification failures into 401s.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::auth::token::{identity_from_claims, verify};
use crate::chunk::request_cookie;
use crate::engine::HostEngine;
use crate::identity::{AuthMethod, Identity};

pub async fn auth_middleware(
    State(engine): State<Arc<HostEngine>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(identity) = resolve_identity(&engine, &req) {
        req.extensions_mut().insert(identity);
    }
    next.run(req).await
}

fn resolve_identity(engine: &HostEngine, req: &Request) -> Option<Identity> {
    let headers = req.headers();
    let keys = engine.keys();

    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return match verify(&keys, bearer) {
            Ok(claims) => Some(identity_from_claims(claims, Some(AuthMethod::Bearer))),
            Err(e) => {
                tracing::debug!("bearer token rejected: {e}");
                None
            }
        };
    }

    let cookie_name = &engine.config().session.cookie_name;
    if let Some(token) = request_cookie(headers, cookie_name) {
        return match verify(&keys, &token) {
            Ok(claims) => Some(identity_from_claims(claims, None)),
            Err(e) => {
                tracing::debug!("session cookie rejected: {e}");
                None
            }
        };
    }

    None
}
