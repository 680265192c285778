//! Design sniffer middleware
//!
//! Active only when a sniffer is configured and the path is outside the
//! reserved `/-` prefix. The request body is buffered up to the capture
//! limit so both the downstream handler and the sniffer can read it — the
//! downstream always sees the full original stream. A downstream 404 with a
//! non-nil analysis becomes a 303 to the inspection dashboard.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::StreamExt;
use std::sync::Arc;

use crate::auth::session::base_url;
use crate::engine::HostEngine;
use crate::sniffer::{redirect_body, wants_text, RequestSnapshot};

/// Header pointing at the sniffer documentation, set on every handoff
pub const DOCS_HEADER: &str = "x-kdex-sniffer-docs";

pub async fn sniffer_middleware(
    State(engine): State<Arc<HostEngine>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(sniffer) = engine.sniffer() else {
        return next.run(req).await;
    };
    if req.uri().path().starts_with("/-") {
        return next.run(req).await;
    }

    let limit = engine.config().sniffer.body_limit_bytes;

    // Snapshot request metadata before the parts move back into the
    // rebuilt request.
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let absolute_base = base_url(req.headers());

    let (parts, body) = req.into_parts();
    let mut stream = body.into_data_stream();
    let mut replayed = Vec::new();
    let mut captured: Vec<u8> = Vec::new();
    let mut truncated = false;

    while captured.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let remaining = limit - captured.len();
                if chunk.len() > remaining {
                    captured.extend_from_slice(&chunk[..remaining]);
                    truncated = true;
                } else {
                    captured.extend_from_slice(&chunk);
                }
                replayed.push(Ok(chunk));
            }
            Some(Err(e)) => {
                replayed.push(Err(e));
                break;
            }
            None => break,
        }
    }

    // Downstream sees the buffered frames followed by whatever was not
    // read; the sniffer sees at most `limit` bytes.
    let replay = futures::stream::iter(replayed).chain(stream);
    let req = Request::from_parts(parts, Body::from_stream(replay));

    let response = next.run(req).await;
    if response.status() != StatusCode::NOT_FOUND {
        return response;
    }

    let snapshot = RequestSnapshot {
        method,
        path,
        query,
        headers,
        body: captured,
        body_truncated: truncated,
    };
    let Some(analysis) = sniffer.analyze(&snapshot) else {
        return response;
    };

    let id = engine.analysis_cache.insert(snapshot, analysis);
    let format = if wants_text(user_agent.as_deref(), accept.as_deref()) {
        "text"
    } else {
        "html"
    };
    let location = format!(
        "{}/{id}?format={format}",
        engine.config().sniffer.dashboard_base.trim_end_matches('/')
    );
    let absolute = format!("{absolute_base}{location}");
    let docs = format!("{absolute_base}/-/sniffer/docs");

    tracing::info!(path = %location, "design sniffer drafted an operation from a 404");

    let mut builder = Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::LOCATION, location)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if let Ok(docs) = HeaderValue::from_str(&docs) {
        builder = builder.header(DOCS_HEADER, docs);
    }
    builder
        .body(Body::from(redirect_body(&absolute)))
        .unwrap_or(response)
}
