//! Response interceptor
//!
//! The tower rendition of a response-writer decorator with a small state
//! machine: a response below 400 forwards untouched; at 400 and above the
//! status is held, the body is redirected into an in-memory message buffer,
//! and the final body is rewritten with the host's "error" utility page
//! (plaintext fallback when none is bound). Runs outermost so the design
//! sniffer has already had its chance to replace a 404 with a 303.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::decl::UtilityKind;
use crate::engine::HostEngine;
use crate::sniffer::escape_html;

/// Upper bound on buffered error-body bytes
const MAX_ERROR_BODY: usize = 64 * 1024;

pub async fn error_interceptor(
    State(engine): State<Arc<HostEngine>>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;
    let status = response.status();
    if status.as_u16() < 400 {
        return response;
    }

    // bodyBuffered: capture the downstream error text as the message
    let (parts, body) = response.into_parts();
    let message_bytes = axum::body::to_bytes(body, MAX_ERROR_BODY)
        .await
        .unwrap_or_default();
    let message = String::from_utf8_lossy(&message_bytes).trim().to_string();

    let kind = if status == StatusCode::NOT_FOUND {
        UtilityKind::NotFound
    } else {
        UtilityKind::Error
    };
    let template = engine
        .utility_template(kind)
        .or_else(|| engine.utility_template(UtilityKind::Error));

    let (content_type, rendered) = match template {
        Some(template) => (
            "text/html; charset=utf-8",
            render_error_page(&template, status, &message),
        ),
        None => (
            "text/plain; charset=utf-8",
            plaintext_fallback(status, &message),
        ),
    };

    let mut rebuilt = Response::builder().status(status);
    if let Some(headers) = rebuilt.headers_mut() {
        for (name, value) in &parts.headers {
            // the rewritten body invalidates the entity headers
            if name == header::CONTENT_TYPE || name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Ok(value) = content_type.parse() {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    match rebuilt.body(Body::from(rendered)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to rebuild error response: {e}");
            (status, String::new()).into_response()
        }
    }
}

fn render_error_page(template: &str, status: StatusCode, message: &str) -> String {
    template
        .replace("{{status}}", status.as_str())
        .replace(
            "{{reason}}",
            status.canonical_reason().unwrap_or("Error"),
        )
        .replace("{{message}}", &escape_html(message))
}

fn plaintext_fallback(status: StatusCode, message: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    if message.is_empty() {
        format!("{} {}\n", status.as_u16(), reason)
    } else {
        format!("{} {}\n\n{}\n", status.as_u16(), reason, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_page_substitutes_and_escapes() {
        let html = render_error_page(
            "<h1>{{status}} {{reason}}</h1><p>{{message}}</p>",
            StatusCode::NOT_FOUND,
            "no route for '/x<script>'",
        );
        assert!(html.contains("<h1>404 Not Found</h1>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_plaintext_fallback() {
        assert_eq!(
            plaintext_fallback(StatusCode::BAD_GATEWAY, ""),
            "502 Bad Gateway\n"
        );
        assert_eq!(
            plaintext_fallback(StatusCode::BAD_REQUEST, "missing client_id"),
            "400 Bad Request\n\nmissing client_id\n"
        );
    }
}
