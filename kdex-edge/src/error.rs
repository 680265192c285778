//! Error types and HTTP response conversion

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type alias using the edge error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the edge
///
/// Large foreign error types are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Input validation failure (missing/invalid query params, malformed forms)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication failure (missing/invalid/expired credentials)
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Resource not found (unknown page, navigation key, language, schema)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request method not supported by the matched route
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// JWT error
    #[error("Token error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// Cryptographic failure (cookie sealing, key material)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Template render failure
    #[error("Render error: {0}")]
    Render(String),

    /// Upstream transport failure (reverse proxy)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream deadline exceeded (reverse proxy)
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Jwt(_) => StatusCode::UNAUTHORIZED,
            Error::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            // Internal failures carry a captured backtrace in the log, never
            // in the response body.
            tracing::error!(
                status = status.as_u16(),
                backtrace = %std::backtrace::Backtrace::capture(),
                "request failed: {self}"
            );
        } else {
            tracing::debug!(status = status.as_u16(), "request rejected: {self}");
        }

        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, "Bearer".parse().expect("static"));
        }
        response
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Upstream("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::UpstreamTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_carries_www_authenticate() {
        let response = Error::Unauthorized("no bearer".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer")
        );
    }
}
