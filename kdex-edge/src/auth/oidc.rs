//! OIDC provider seam
//!
//! The engine talks to the upstream provider through the [`OidcProvider`]
//! trait: build an authorization URL, exchange a code for the raw ID token,
//! and expose the end-session endpoint. [`StandardOidcProvider`] implements
//! it for any provider with manually configured endpoints.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use oauth2::basic::{BasicErrorResponse, BasicTokenType};
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, ExtraTokenFields,
    RedirectUrl, Scope, StandardRevocableToken, StandardTokenIntrospectionResponse,
    StandardTokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decl::OidcSettings;
use crate::error::{Error, Result};

/// Token-response extension carrying the OIDC ID token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

/// Type alias for our configured OAuth client
type ConfiguredClient = Client<
    BasicErrorResponse,
    StandardTokenResponse<IdTokenFields, BasicTokenType>,
    StandardTokenIntrospectionResponse<IdTokenFields, BasicTokenType>,
    StandardRevocableToken,
    BasicErrorResponse,
    oauth2::EndpointSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

/// Upstream OIDC provider contract
#[async_trait]
pub trait OidcProvider: Send + Sync {
    /// Authorization URL the login flow redirects to; `state` round-trips
    /// the local return path
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for the provider's raw ID token
    async fn exchange_code(&self, code: &str) -> Result<String>;

    /// RP-initiated logout endpoint, when the provider offers one
    fn end_session_url(&self) -> Option<&str>;
}

/// OIDC provider with manually configured endpoints
pub struct StandardOidcProvider {
    client: ConfiguredClient,
    http: reqwest::Client,
    scopes: Vec<String>,
    end_session_url: Option<String>,
}

impl StandardOidcProvider {
    /// Build from declared provider settings
    pub fn new(settings: &OidcSettings) -> Result<Self> {
        let auth_url = AuthUrl::new(settings.auth_url.clone())
            .map_err(|e| Error::BadRequest(format!("invalid OIDC auth URL: {e}")))?;
        let token_url = TokenUrl::new(settings.token_url.clone())
            .map_err(|e| Error::BadRequest(format!("invalid OIDC token URL: {e}")))?;
        let redirect_url = RedirectUrl::new(settings.redirect_url.clone())
            .map_err(|e| Error::BadRequest(format!("invalid OIDC redirect URL: {e}")))?;

        let client = Client::new(ClientId::new(settings.client_id.clone()))
            .set_client_secret(ClientSecret::new(settings.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build OIDC HTTP client: {e}")))?;

        let scopes = if settings.scopes.is_empty() {
            vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ]
        } else {
            settings.scopes.clone()
        };

        Ok(Self {
            client,
            http,
            scopes,
            end_session_url: settings.end_session_url.clone(),
        })
    }
}

#[async_trait]
impl OidcProvider for StandardOidcProvider {
    fn authorization_url(&self, state: &str) -> String {
        let state = state.to_string();
        let (url, _csrf) = self
            .client
            .authorize_url(move || CsrfToken::new(state.clone()))
            .add_scopes(self.scopes.iter().map(|s| Scope::new(s.clone())))
            .url();
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Unauthorized(format!("OIDC code exchange failed: {e}")))?;

        response
            .extra_fields()
            .id_token
            .clone()
            .ok_or_else(|| Error::Unauthorized("provider response carried no ID token".into()))
    }

    fn end_session_url(&self) -> Option<&str> {
        self.end_session_url.as_deref()
    }
}

/// Decode an ID token's payload without verifying its signature
///
/// The provider's token endpoint was reached over TLS with client
/// authentication, so the payload is trusted for local subject resolution;
/// the raw token is only ever replayed back to the provider as a logout
/// hint.
pub fn unverified_claims(id_token: &str) -> Result<Map<String, Value>> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Unauthorized("ID token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Unauthorized(format!("ID token payload is not base64url: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Unauthorized(format!("ID token payload is not JSON: {e}")))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Unauthorized("ID token payload is not an object".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> OidcSettings {
        OidcSettings {
            client_id: "edge".into(),
            client_secret: "secret".into(),
            auth_url: "https://idp.example/authorize".into(),
            token_url: "https://idp.example/token".into(),
            redirect_url: "https://host.example/-/oauth/callback".into(),
            end_session_url: Some("https://idp.example/logout".into()),
            scopes: vec![],
        }
    }

    #[test]
    fn test_authorization_url_carries_state_and_scopes() {
        let provider = StandardOidcProvider::new(&settings()).unwrap();
        let url = provider.authorization_url("/dashboard");
        assert!(url.starts_with("https://idp.example/authorize?"));
        assert!(url.contains("client_id=edge"));
        assert!(url.contains("state=%2Fdashboard"));
        assert!(url.contains("scope=openid"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn test_end_session_url() {
        let provider = StandardOidcProvider::new(&settings()).unwrap();
        assert_eq!(
            provider.end_session_url(),
            Some("https://idp.example/logout")
        );
    }

    #[test]
    fn test_unverified_claims() {
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({"sub": "ada", "email": "ada@example.com"})).unwrap(),
        );
        let token = format!("hdr.{payload}.sig");
        let claims = unverified_claims(&token).unwrap();
        assert_eq!(claims.get("sub"), Some(&json!("ada")));
    }

    #[test]
    fn test_unverified_claims_rejects_malformed() {
        assert!(unverified_claims("no-dots").is_err());
        assert!(unverified_claims("a.!!!.c").is_err());
    }

    #[test]
    fn test_invalid_endpoint_urls() {
        let mut bad = settings();
        bad.auth_url = "not a url".into();
        assert!(StandardOidcProvider::new(&bad).is_err());
    }
}
