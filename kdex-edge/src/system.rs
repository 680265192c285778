//! System surface and resource handlers
//!
//! Everything mounted under the reserved `/-` prefix plus the well-known
//! endpoints, the favicon, and the page/function/announcement handlers the
//! route table dispatches to.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{
    self, account_identity, base_url, clear_session_cookie, is_secure, session_cookie,
    validate_return,
};
use crate::decl::{PageBinding, UtilityKind};
use crate::engine::{HostEngine, Materialized};
use crate::error::{Error, Result};
use crate::gate::{check_access, ResourceKind};
use crate::i18n::is_valid_language_tag;
use crate::identity::{user_hash, AuthMethod, Identity};
use crate::render::{
    nav_cache_key, page_cache_key, render_navigation, render_page, spawn_migration, RenderContext,
    NS_NAV, NS_PAGE,
};
use crate::sniffer::{render_html, render_text, SNIFFER_DOCS};
use crate::table::{
    simple_operation, FunctionRoute, OpenApiFilter, PathInfo, PathKind, RouteTarget, SystemRoute,
    TableBuilder,
};

/// Base name of the encrypted ID-token hint cookies
pub const OIDC_HINT_COOKIE: &str = "oidc_hint";

type Params = BTreeMap<String, String>;

/// Register the default system routes into a fresh table build
pub(crate) fn register_system_routes(builder: &mut TableBuilder) {
    let mut add = |pattern: &str, route: SystemRoute, method: &str, summary: &str| {
        let info = PathInfo::new(pattern, PathKind::System)
            .with_summary(summary)
            .with_tag("system")
            .with_operation(method, simple_operation(summary, "system"));
        builder.register(pattern, RouteTarget::System(route), Some(info));
    };

    add("/favicon.ico", SystemRoute::Favicon, "get", "Host favicon");
    add(
        "/.well-known/openid-configuration",
        SystemRoute::OidcDiscovery,
        "get",
        "OIDC discovery document",
    );
    add(
        "/.well-known/oauth-authorization-server",
        SystemRoute::OauthMetadata,
        "get",
        "OAuth 2.0 authorization server metadata",
    );
    add(
        "/.well-known/jwks.json",
        SystemRoute::Jwks,
        "get",
        "JSON Web Key Set",
    );
    add("/-/login", SystemRoute::Login, "get", "Local login");
    add("/-/logout", SystemRoute::Logout, "post", "Logout");
    add(
        "/-/oauth/authorize",
        SystemRoute::Authorize,
        "get",
        "Authorization code issuance",
    );
    add(
        "/-/oauth/callback",
        SystemRoute::Callback,
        "get",
        "OIDC callback",
    );
    add("/-/token", SystemRoute::Token, "post", "Token exchange");
    add("/-/state/", SystemRoute::State, "get", "Identity state");
    add("/-/openapi", SystemRoute::OpenApi, "get", "Aggregated OpenAPI");
    add(
        "/-/schema/{*path}",
        SystemRoute::Schema,
        "get",
        "JSON Schema fragment",
    );
    add(
        "/-/navigation/{nav_key}/{l10n}/{*base_path}",
        SystemRoute::Navigation,
        "get",
        "Navigation fragment",
    );
    add(
        "/-/translation/{l10n}",
        SystemRoute::Translation,
        "get",
        "Translation export",
    );
    add(
        "/-/sniffer/inspect/{id}",
        SystemRoute::SnifferInspect,
        "get",
        "Sniffer inspection dashboard",
    );
    add(
        "/-/sniffer/docs",
        SystemRoute::SnifferDocs,
        "get",
        "Sniffer documentation",
    );

    // Route-only aliases: the bare state path and the dashboard alias the
    // sniffer redirect points at.
    builder.route("/-/state", RouteTarget::System(SystemRoute::State));
    builder.route("/inspect/{id}", RouteTarget::System(SystemRoute::SnifferInspect));
}

/// Dispatch a matched system route
pub(crate) async fn handle_system(
    engine: &Arc<HostEngine>,
    mat: &Arc<Materialized>,
    route: SystemRoute,
    params: Params,
    identity: Option<&Identity>,
    req: Request,
) -> Result<Response> {
    let method = req.method().clone();
    match (route, method.as_str()) {
        (SystemRoute::Favicon, "GET" | "HEAD") => favicon(engine, &req),
        (SystemRoute::OidcDiscovery, "GET") => oidc_discovery(engine, &req),
        (SystemRoute::OauthMetadata, "GET") => oauth_metadata(&req),
        (SystemRoute::Jwks, "GET") => jwks(engine),
        (SystemRoute::Login, "GET") => login_page(engine, identity, &req),
        (SystemRoute::Login, "POST") => login_submit(engine, req).await,
        (SystemRoute::Logout, "POST") => logout(engine, &req),
        (SystemRoute::Authorize, "GET") => authorize(engine, identity, &req),
        (SystemRoute::Callback, "GET") => callback(engine, req).await,
        (SystemRoute::Token, "POST") => token(engine, req).await,
        (SystemRoute::State, "GET") => identity_state(identity),
        (SystemRoute::OpenApi, "GET") => openapi(engine, mat, &req),
        (SystemRoute::Schema, "GET") => schema(mat, &params),
        (SystemRoute::Navigation, "GET") => navigation(engine, mat, &params, identity, &req),
        (SystemRoute::Translation, "GET") => translation(mat, &params, &req),
        (SystemRoute::SnifferInspect, "GET") => sniffer_inspect(engine, &params, &req),
        (SystemRoute::SnifferDocs, "GET") => sniffer_docs(),
        (route, _) => Err(Error::MethodNotAllowed(format!(
            "{method} not supported by {route:?}"
        ))),
    }
}

// ---- favicon and metadata -----------------------------------------------

fn favicon(engine: &Arc<HostEngine>, req: &Request) -> Result<Response> {
    let meta = engine.host_meta();
    let entry = engine
        .favicon_cache
        .get_or_generate(engine.favicon_generator().as_ref(), &meta)?;

    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let if_modified_since = req
        .headers()
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok());

    let mut builder = Response::builder()
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .header(header::ETAG, entry.etag.clone())
        .header(
            header::LAST_MODIFIED,
            crate::favicon::http_date(entry.last_modified),
        );

    if crate::favicon::not_modified(&entry, if_none_match, if_modified_since) {
        builder = builder.status(StatusCode::NOT_MODIFIED);
        return builder
            .body(Body::empty())
            .map_err(|e| Error::Internal(format!("favicon 304 assembly failed: {e}")));
    }

    builder
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/svg+xml")
        .body(Body::from(entry.svg))
        .map_err(|e| Error::Internal(format!("favicon assembly failed: {e}")))
}

fn oidc_discovery(engine: &Arc<HostEngine>, req: &Request) -> Result<Response> {
    let issuer = base_url(req.headers());
    let doc = json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/-/oauth/authorize"),
        "token_endpoint": format!("{issuer}/-/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "end_session_endpoint": format!("{issuer}/-/logout"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "password"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": engine.keys().algorithms(),
    });
    json_response(&doc, false)
}

fn oauth_metadata(req: &Request) -> Result<Response> {
    let issuer = base_url(req.headers());
    let doc = json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/-/oauth/authorize"),
        "token_endpoint": format!("{issuer}/-/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "password"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
    });
    json_response(&doc, false)
}

fn jwks(engine: &Arc<HostEngine>) -> Result<Response> {
    json_response(&engine.keys().jwks(), false)
}

// ---- login / logout -----------------------------------------------------

fn login_page(
    engine: &Arc<HostEngine>,
    identity: Option<&Identity>,
    req: &Request,
) -> Result<Response> {
    let pairs = query_pairs(req.uri().query());
    let return_to = first(&pairs, "return")
        .and_then(validate_return)
        .unwrap_or("/")
        .to_string();

    if identity.is_some() {
        return Ok(see_other(&return_to));
    }

    // Delegated login: hand off to the provider with the local return path
    // as state.
    if let Some(provider) = engine.oidc_provider() {
        return Ok(see_other(&provider.authorization_url(&return_to)));
    }

    let error = first(&pairs, "error").unwrap_or("");
    let error_html = if error.is_empty() {
        String::new()
    } else {
        "<p class=\"error\">Invalid username or password.</p>".to_string()
    };

    let html = match engine.utility_template(UtilityKind::Login) {
        Some(template) => template
            .replace("{{return}}", &crate::sniffer::escape_html(&return_to))
            .replace("{{error}}", &error_html),
        None => builtin_login_page(&return_to, &error_html),
    };
    html_response(html, None)
}

fn builtin_login_page(return_to: &str, error_html: &str) -> String {
    format!(
        "<!doctype html>\n<html><head><title>Sign in</title></head><body>\n<h1>Sign in</h1>\n{error_html}<form method=\"post\" action=\"/-/login\">\n<input type=\"hidden\" name=\"return\" value=\"{}\">\n<label>Username <input name=\"username\" autocomplete=\"username\"></label>\n<label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\"></label>\n<button type=\"submit\">Sign in</button>\n</form>\n</body></html>\n",
        crate::sniffer::escape_html(return_to)
    )
}

async fn login_submit(engine: &Arc<HostEngine>, req: Request) -> Result<Response> {
    let secure = is_secure(req.headers());
    let pairs = form_pairs(req).await?;
    let username = first(&pairs, "username").unwrap_or("");
    let password = first(&pairs, "password").unwrap_or("");
    let return_to = first(&pairs, "return")
        .and_then(validate_return)
        .unwrap_or("/")
        .to_string();

    if username.is_empty() || password.is_empty() {
        return Err(Error::BadRequest("username and password are required".into()));
    }

    let settings = engine.auth_settings();
    let authenticated = match settings.account(username) {
        Some(account) => auth::verify_password(account, password)?,
        None => false,
    };

    if !authenticated {
        tracing::debug!(username = %username, "login rejected");
        let location = format!(
            "/-/login?error=invalid_credentials&return={}",
            urlencoding::encode(&return_to)
        );
        return Ok(see_other(&location));
    }

    let account = settings
        .account(username)
        .ok_or_else(|| Error::Internal("account disappeared mid-login".into()))?;
    let token = auth::issue(
        &engine.keys(),
        &account.username,
        &[],
        AuthMethod::Password,
        account.claims.clone(),
        engine.config().session.ttl(),
    )?;

    let cookie = session_cookie(
        &engine.config().session.cookie_name,
        &token,
        secure,
        engine.config().session.ttl_secs as i64,
    );
    let mut response = see_other(&return_to);
    append_cookie(&mut response, &cookie)?;
    Ok(response)
}

fn logout(engine: &Arc<HostEngine>, req: &Request) -> Result<Response> {
    let headers = req.headers();
    let secure = is_secure(headers);
    let local_return = auth::session::referer_path(headers).unwrap_or_else(|| "/".to_string());

    let location = match engine
        .oidc_provider()
        .and_then(|p| p.end_session_url().map(str::to_string))
    {
        Some(end_session) => {
            match engine.chunker.read_chunks(OIDC_HINT_COOKIE, headers) {
                Ok(id_token) => {
                    let hint = String::from_utf8_lossy(&id_token).to_string();
                    let post_logout = format!("{}{local_return}", base_url(headers));
                    format!(
                        "{end_session}?id_token_hint={}&post_logout_redirect_uri={}",
                        urlencoding::encode(&hint),
                        urlencoding::encode(&post_logout)
                    )
                }
                Err(e) => {
                    tracing::debug!("no usable ID-token hint, local logout only: {e}");
                    local_return.clone()
                }
            }
        }
        None => local_return.clone(),
    };

    let mut response = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .map_err(|e| Error::Internal(format!("logout response assembly failed: {e}")))?;

    let cookie = clear_session_cookie(&engine.config().session.cookie_name, secure);
    append_cookie(&mut response, &cookie)?;
    for removal in crate::chunk::removal_chunks(OIDC_HINT_COOKIE, headers, secure) {
        append_cookie(&mut response, &removal)?;
    }
    Ok(response)
}

// ---- OAuth / OIDC exchange ----------------------------------------------

fn authorize(
    engine: &Arc<HostEngine>,
    identity: Option<&Identity>,
    req: &Request,
) -> Result<Response> {
    let pairs = query_pairs(req.uri().query());
    let client_id = first(&pairs, "client_id")
        .ok_or_else(|| Error::BadRequest("client_id is required".into()))?;
    let redirect_uri = first(&pairs, "redirect_uri")
        .ok_or_else(|| Error::BadRequest("redirect_uri is required".into()))?;
    let response_type = first(&pairs, "response_type").unwrap_or("");
    let scope = first(&pairs, "scope").map(str::to_string);
    let state = first(&pairs, "state").map(str::to_string);

    let settings = engine.auth_settings();
    let client = settings
        .client(client_id)
        .ok_or_else(|| Error::BadRequest(format!("unknown client '{client_id}'")))?;
    if !client.redirect_uris.iter().any(|u| u == redirect_uri) {
        return Err(Error::BadRequest("redirect_uri is not registered".into()));
    }
    if response_type != "code" {
        return Err(Error::BadRequest(format!(
            "unsupported response_type '{response_type}'"
        )));
    }

    let Some(identity) = identity else {
        let location = format!(
            "/-/login?return={}",
            urlencoding::encode(&path_and_query(req))
        );
        return Ok(see_other(&location));
    };

    let code = engine.codes.issue(
        identity.subject.clone(),
        client_id.to_string(),
        scope,
        redirect_uri.to_string(),
        identity.method,
    );

    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut location = format!("{redirect_uri}{separator}code={code}");
    if let Some(state) = state {
        location.push_str(&format!("&state={}", urlencoding::encode(&state)));
    }

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .map_err(|e| Error::Internal(format!("authorize response assembly failed: {e}")))
}

async fn callback(engine: &Arc<HostEngine>, req: Request) -> Result<Response> {
    let pairs = query_pairs(req.uri().query());
    let code = first(&pairs, "code")
        .ok_or_else(|| Error::BadRequest("code is required".into()))?;
    let state = first(&pairs, "state")
        .ok_or_else(|| Error::BadRequest("state is required".into()))?;
    let state = validate_return(state)
        .ok_or_else(|| Error::BadRequest("state must be a local path".into()))?
        .to_string();

    let provider = engine
        .oidc_provider()
        .ok_or_else(|| Error::Internal("no OIDC provider configured".into()))?;

    let headers = req.headers().clone();
    let secure = is_secure(&headers);

    let id_token = provider.exchange_code(code).await?;

    // Local subject resolution: prefer the token's subject/email claims;
    // providers issuing opaque tokens still get a stable derived subject.
    let provider_claims = auth::unverified_claims(&id_token).unwrap_or_default();
    let subject = provider_claims
        .get("sub")
        .or_else(|| provider_claims.get("email"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!("oidc-{}", &blake3::hash(id_token.as_bytes()).to_hex()[..12])
        });

    let mut claims = Map::new();
    for key in ["email", "name", "preferred_username", "groups", "roles"] {
        if let Some(value) = provider_claims.get(key) {
            claims.insert(key.to_string(), value.clone());
        }
    }

    let token = auth::issue(
        &engine.keys(),
        &subject,
        &[],
        AuthMethod::Oidc,
        claims,
        engine.config().session.ttl(),
    )?;

    let mut response = see_other(&state);

    let cookie = session_cookie(
        &engine.config().session.cookie_name,
        &token,
        secure,
        engine.config().session.ttl_secs as i64,
    );
    append_cookie(&mut response, &cookie)?;

    let hint_cookies = engine.chunker.write_chunks(
        OIDC_HINT_COOKIE,
        id_token.as_bytes(),
        &headers,
        secure,
        engine.config().chunker.hint_ttl_secs as i64,
    )?;
    for hint in &hint_cookies {
        append_cookie(&mut response, hint)?;
    }

    tracing::info!(subject = %subject, "OIDC callback established a session");
    Ok(response)
}

async fn token(engine: &Arc<HostEngine>, req: Request) -> Result<Response> {
    let pairs = form_pairs(req).await?;
    let grant_type = first(&pairs, "grant_type").unwrap_or("");

    match grant_type {
        "authorization_code" => {
            let code = first(&pairs, "code")
                .ok_or_else(|| Error::BadRequest("code is required".into()))?;
            let client_id = first(&pairs, "client_id")
                .ok_or_else(|| Error::BadRequest("client_id is required".into()))?;
            let redirect_uri = first(&pairs, "redirect_uri")
                .ok_or_else(|| Error::BadRequest("redirect_uri is required".into()))?;

            let settings = engine.auth_settings();
            let client = settings
                .client(client_id)
                .ok_or_else(|| Error::BadRequest("invalid_client".into()))?;
            if let Some(expected) = &client.client_secret {
                if first(&pairs, "client_secret") != Some(expected.as_str()) {
                    return Err(Error::Unauthorized("invalid_client".into()));
                }
            }

            let record = engine
                .codes
                .consume(code)
                .ok_or_else(|| Error::BadRequest("invalid_grant".into()))?;
            if record.client_id != client_id || record.redirect_uri != redirect_uri {
                return Err(Error::BadRequest("invalid_grant".into()));
            }

            let scopes: Vec<String> = record
                .scope
                .as_deref()
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            let token = auth::issue(
                &engine.keys(),
                &record.subject,
                &scopes,
                AuthMethod::Code,
                Map::new(),
                engine.config().session.ttl(),
            )?;
            token_success(&token, engine.config().session.ttl(), record.scope.as_deref())
        }
        "password" => {
            let username = first(&pairs, "username")
                .ok_or_else(|| Error::BadRequest("username is required".into()))?;
            let password = first(&pairs, "password")
                .ok_or_else(|| Error::BadRequest("password is required".into()))?;
            let scope = first(&pairs, "scope").map(str::to_string);

            let settings = engine.auth_settings();
            let account = settings
                .account(username)
                .ok_or_else(|| Error::Unauthorized("invalid_grant".into()))?;
            if !auth::verify_password(account, password)? {
                return Err(Error::Unauthorized("invalid_grant".into()));
            }

            let identity = account_identity(account, AuthMethod::Password);
            let scopes: Vec<String> = scope
                .as_deref()
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            let token = auth::issue(
                &engine.keys(),
                &identity.subject,
                &scopes,
                AuthMethod::Password,
                identity.claims,
                engine.config().session.ttl(),
            )?;
            token_success(&token, engine.config().session.ttl(), scope.as_deref())
        }
        other => Err(Error::BadRequest(format!(
            "unsupported_grant_type '{other}'"
        ))),
    }
}

fn token_success(token: &str, ttl: Duration, scope: Option<&str>) -> Result<Response> {
    let mut body = json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": ttl.as_secs(),
    });
    if let Some(scope) = scope {
        body["scope"] = json!(scope);
    }
    json_response(&body, false)
}

fn identity_state(identity: Option<&Identity>) -> Result<Response> {
    let identity =
        identity.ok_or_else(|| Error::Unauthorized("no identity established".into()))?;
    let body = json!({
        "subject": identity.subject,
        "auth_method": identity.method.as_str(),
        "scopes": identity.scopes,
        "claims": identity.claims,
    });
    json_response(&body, true)
}

// ---- introspection ------------------------------------------------------

fn openapi(engine: &Arc<HostEngine>, mat: &Arc<Materialized>, req: &Request) -> Result<Response> {
    let pairs = query_pairs(req.uri().query());

    let mut filter = OpenApiFilter::default();
    for (key, value) in &pairs {
        match key.as_str() {
            "path" => filter.paths.push(value.clone()),
            "tag" => filter.tags.push(value.clone()),
            "type" => match PathKind::parse(value) {
                Some(kind) => filter.kinds.push(kind),
                None => {
                    return Err(Error::BadRequest(format!("unknown type filter '{value}'")))
                }
            },
            _ => {}
        }
    }
    let pretty = pairs.iter().any(|(k, _)| k == "pretty");

    let doc = crate::table::build_openapi(
        &engine.host_meta(),
        &mat.path_infos,
        &mat.schemas,
        &filter,
    );
    let body = if pretty {
        serde_json::to_string_pretty(&doc)
    } else {
        serde_json::to_string(&doc)
    }
    .map_err(|e| Error::Internal(format!("OpenAPI serialization failed: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(body))
        .map_err(|e| Error::Internal(format!("OpenAPI response assembly failed: {e}")))
}

fn schema(mat: &Arc<Materialized>, params: &Params) -> Result<Response> {
    let name = params
        .get("path")
        .ok_or_else(|| Error::BadRequest("schema name is required".into()))?;
    let schema = mat
        .schemas
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("no schema named '{name}'")))?;
    let body = serde_json::to_value(schema)
        .map_err(|e| Error::Internal(format!("schema serialization failed: {e}")))?;
    json_response(&body, true)
}

fn navigation(
    engine: &Arc<HostEngine>,
    mat: &Arc<Materialized>,
    params: &Params,
    identity: Option<&Identity>,
    req: &Request,
) -> Result<Response> {
    let nav_key = params
        .get("nav_key")
        .ok_or_else(|| Error::BadRequest("navigation key is required".into()))?;
    let lang = params
        .get("l10n")
        .ok_or_else(|| Error::BadRequest("language is required".into()))?;
    let base_path = format!(
        "/{}",
        params.get("base_path").map(String::as_str).unwrap_or("")
    );

    if !is_valid_language_tag(lang) {
        return Err(Error::BadRequest(format!("invalid language tag '{lang}'")));
    }
    if !mat.catalog.supports(lang) {
        return Err(Error::NotFound(format!("no translations for '{lang}'")));
    }

    let Some((RouteTarget::Page { page, .. }, _)) = mat.table.lookup(&base_path) else {
        return Err(Error::NotFound(format!("no page at '{base_path}'")));
    };
    let template = page
        .navigations
        .get(nav_key)
        .ok_or_else(|| Error::NotFound(format!("page has no navigation '{nav_key}'")))?
        .clone();

    if let Some(denied) = gate_response(
        engine,
        identity,
        ResourceKind::Navigation,
        &page.name,
        &page.security,
        req,
    )? {
        return Ok(denied);
    }

    let hash = user_hash(identity);
    let key = nav_cache_key(nav_key, &base_path, lang, &hash);

    let html = match engine.render_cache.get(NS_NAV, &key) {
        Some(hit) if hit.is_current => hit.value,
        Some(hit) => {
            spawn_nav_migration(engine, mat, &page, template.clone(), lang, key.clone(), identity);
            hit.value
        }
        None => {
            let meta = engine.host_meta();
            let theme = engine.theme_assets();
            let ctx = RenderContext {
                meta: &meta,
                page: &page,
                lang,
                catalog: &mat.catalog,
                identity,
                theme_assets: &theme,
            };
            let html = render_navigation(engine.renderer().as_ref(), &ctx, &template)?;
            engine.render_cache.set(NS_NAV, &key, html.clone());
            html
        }
    };

    html_response(html, Some(lang))
}

fn spawn_nav_migration(
    engine: &Arc<HostEngine>,
    mat: &Arc<Materialized>,
    page: &Arc<PageBinding>,
    template: String,
    lang: &str,
    key: String,
    identity: Option<&Identity>,
) {
    let renderer = Arc::clone(engine.renderer());
    let meta = engine.host_meta();
    let theme = engine.theme_assets();
    let page = Arc::clone(page);
    let catalog = mat.catalog.clone();
    let lang = lang.to_string();
    let identity = identity.cloned();

    spawn_migration(
        Arc::clone(&engine.render_cache),
        NS_NAV,
        key,
        Box::new(move || {
            let ctx = RenderContext {
                meta: &meta,
                page: &page,
                lang: &lang,
                catalog: &catalog,
                identity: identity.as_ref(),
                theme_assets: &theme,
            };
            render_navigation(renderer.as_ref(), &ctx, &template)
        }),
    );
}

fn translation(mat: &Arc<Materialized>, params: &Params, req: &Request) -> Result<Response> {
    let lang = params
        .get("l10n")
        .ok_or_else(|| Error::BadRequest("language is required".into()))?;
    if !is_valid_language_tag(lang) {
        return Err(Error::BadRequest(format!("invalid language tag '{lang}'")));
    }

    let pairs = query_pairs(req.uri().query());
    let keys: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k == "key")
        .map(|(_, v)| v.clone())
        .collect();

    let table = mat
        .catalog
        .export(lang, &keys)
        .ok_or_else(|| Error::NotFound(format!("no translations for '{lang}'")))?;

    let body = serde_json::to_value(&table)
        .map_err(|e| Error::Internal(format!("translation serialization failed: {e}")))?;
    let mut response = json_response(&body, false)?;
    if let Ok(value) = HeaderValue::from_str(lang) {
        response.headers_mut().insert(header::CONTENT_LANGUAGE, value);
    }
    Ok(response)
}

// ---- sniffer dashboard --------------------------------------------------

fn sniffer_inspect(engine: &Arc<HostEngine>, params: &Params, req: &Request) -> Result<Response> {
    let id = params
        .get("id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| Error::NotFound("no such analysis".into()))?;
    let record = engine
        .analysis_cache
        .get(&id)
        .ok_or_else(|| Error::NotFound("analysis expired or unknown".into()))?;

    let pairs = query_pairs(req.uri().query());
    let format = first(&pairs, "format").unwrap_or("html");

    if format == "text" {
        let absolute = format!("{}{}", base_url(req.headers()), path_and_query(req));
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(render_text(&record, &absolute)))
            .map_err(|e| Error::Internal(format!("dashboard assembly failed: {e}")));
    }
    html_response(render_html(&record), None)
}

fn sniffer_docs() -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/markdown; charset=utf-8")
        .body(Body::from(SNIFFER_DOCS))
        .map_err(|e| Error::Internal(format!("docs assembly failed: {e}")))
}

// ---- page / function / announcement -------------------------------------

/// Serve a declared page through the render cache
pub(crate) fn serve_page(
    engine: &Arc<HostEngine>,
    mat: &Arc<Materialized>,
    page: &Arc<PageBinding>,
    fixed_lang: Option<&str>,
    identity: Option<&Identity>,
    req: &Request,
) -> Result<Response> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Err(Error::MethodNotAllowed(format!(
            "{} not supported by pages",
            req.method()
        )));
    }

    if let Some(denied) = gate_response(
        engine,
        identity,
        ResourceKind::Page,
        &page.name,
        &page.security,
        req,
    )? {
        return Ok(denied);
    }

    let lang = match fixed_lang {
        Some(lang) => lang.to_string(),
        None => {
            let accept = req
                .headers()
                .get(header::ACCEPT_LANGUAGE)
                .and_then(|v| v.to_str().ok());
            mat.catalog.negotiate(accept).to_string()
        }
    };

    let hash = user_hash(identity);
    let key = page_cache_key(&page.base_path, &lang, &hash);

    let html = match engine.render_cache.get(NS_PAGE, &key) {
        Some(hit) if hit.is_current => hit.value,
        Some(hit) => {
            spawn_page_migration(engine, mat, page, &lang, key.clone(), identity);
            hit.value
        }
        None => {
            let meta = engine.host_meta();
            let theme = engine.theme_assets();
            let ctx = RenderContext {
                meta: &meta,
                page,
                lang: &lang,
                catalog: &mat.catalog,
                identity,
                theme_assets: &theme,
            };
            let html = render_page(engine.renderer().as_ref(), &ctx)?;
            engine.render_cache.set(NS_PAGE, &key, html.clone());
            html
        }
    };

    html_response(html, Some(&lang))
}

fn spawn_page_migration(
    engine: &Arc<HostEngine>,
    mat: &Arc<Materialized>,
    page: &Arc<PageBinding>,
    lang: &str,
    key: String,
    identity: Option<&Identity>,
) {
    let renderer = Arc::clone(engine.renderer());
    let meta = engine.host_meta();
    let theme = engine.theme_assets();
    let page = Arc::clone(page);
    let catalog = mat.catalog.clone();
    let lang = lang.to_string();
    let identity = identity.cloned();

    spawn_migration(
        Arc::clone(&engine.render_cache),
        NS_PAGE,
        key,
        Box::new(move || {
            let ctx = RenderContext {
                meta: &meta,
                page: &page,
                lang: &lang,
                catalog: &catalog,
                identity: identity.as_ref(),
                theme_assets: &theme,
            };
            render_page(renderer.as_ref(), &ctx)
        }),
    );
}

/// Proxy a request to a ready backend function
pub(crate) async fn serve_function(
    engine: &Arc<HostEngine>,
    route: &Arc<FunctionRoute>,
    identity: Option<&Identity>,
    req: Request,
) -> Result<Response> {
    if let Some(denied) = gate_response(
        engine,
        identity,
        ResourceKind::Function,
        &route.name,
        &route.security,
        &req,
    )? {
        return Ok(denied);
    }

    engine
        .proxy
        .forward(route, &engine.keys(), identity, req)
        .await
}

/// Serve the announcement utility page (the empty-host catch-all)
pub(crate) async fn serve_announcement(
    engine: &Arc<HostEngine>,
    _mat: &Arc<Materialized>,
) -> Result<Response> {
    match engine.utility_template(UtilityKind::Announcement) {
        Some(template) => {
            let html = template.replace("{{title}}", &engine.host_meta().title);
            html_response(html, None)
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(
                "This host is being provisioned. Check back soon.\n",
            ))
            .map_err(|e| Error::Internal(format!("announcement assembly failed: {e}"))),
    }
}

/// Evaluate the authorization gate; `Some(response)` short-circuits
///
/// Denied while logged in reads as 404; denied while anonymous redirects to
/// the login page with the original URL as `return`.
fn gate_response(
    engine: &Arc<HostEngine>,
    identity: Option<&Identity>,
    kind: ResourceKind,
    name: &str,
    requirements: &[crate::decl::SecurityRequirement],
    req: &Request,
) -> Result<Option<Response>> {
    let settings = engine.auth_settings();
    let granted = check_access(
        identity,
        kind,
        name,
        requirements,
        &settings.anonymous_entitlements,
    )?;
    if granted {
        return Ok(None);
    }
    if identity.is_some() {
        return Err(Error::NotFound(format!("{kind} '{name}' not found")));
    }
    let location = format!(
        "/-/login?return={}",
        urlencoding::encode(&path_and_query(req))
    );
    Ok(Some(see_other(&location)))
}

// ---- small response helpers ---------------------------------------------

fn see_other(location: &str) -> Response {
    match Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(location = %location, "redirect assembly failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn html_response(html: String, lang: Option<&str>) -> Result<Response> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8");
    if let Some(lang) = lang {
        builder = builder.header(header::CONTENT_LANGUAGE, lang);
    }
    builder
        .body(Body::from(html))
        .map_err(|e| Error::Internal(format!("response assembly failed: {e}")))
}

fn json_response(value: &Value, no_store: bool) -> Result<Response> {
    let body = serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("JSON serialization failed: {e}")))?;
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    if no_store {
        builder = builder.header(header::CACHE_CONTROL, "no-store");
    }
    builder
        .body(Body::from(body))
        .map_err(|e| Error::Internal(format!("response assembly failed: {e}")))
}

fn append_cookie(response: &mut Response, cookie: &cookie::Cookie<'_>) -> Result<()> {
    let value = HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| Error::Internal(format!("cookie not header-safe: {e}")))?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}

/// The request's path plus raw query
fn path_and_query(req: &Request) -> String {
    match req.uri().query() {
        Some(query) => format!("{}?{}", req.uri().path(), query),
        None => req.uri().path().to_string(),
    }
}

/// Decode query/form pairs; `+` reads as space
fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else { return Vec::new() };
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|s| s.into_owned())
        .unwrap_or(plus_decoded)
}

fn first<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Read and parse an `application/x-www-form-urlencoded` body
async fn form_pairs(req: Request) -> Result<Vec<(String, String)>> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/x-www-form-urlencoded") {
        return Err(Error::BadRequest(
            "expected application/x-www-form-urlencoded".into(),
        ));
    }
    let bytes = axum::body::to_bytes(req.into_body(), 64 * 1024)
        .await
        .map_err(|e| Error::BadRequest(format!("unreadable form body: {e}")))?;
    let body = std::str::from_utf8(&bytes)
        .map_err(|_| Error::BadRequest("form body is not UTF-8".into()))?;
    Ok(query_pairs(Some(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs_decoding() {
        let pairs = query_pairs(Some("return=%2Fdocs&x=a+b&flag"));
        assert_eq!(
            pairs,
            vec![
                ("return".to_string(), "/docs".to_string()),
                ("x".to_string(), "a b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn test_first_takes_earliest() {
        let pairs = vec![
            ("key".to_string(), "one".to_string()),
            ("key".to_string(), "two".to_string()),
        ];
        assert_eq!(first(&pairs, "key"), Some("one"));
        assert_eq!(first(&pairs, "missing"), None);
    }

    #[test]
    fn test_builtin_login_page_escapes_return() {
        let html = builtin_login_page("/docs\"><script>", "");
        assert!(!html.contains("\"><script>"));
        assert!(html.contains("&quot;&gt;&lt;script&gt;"));
    }

    #[test]
    fn test_see_other() {
        let response = see_other("/-/login?return=%2Fdocs");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok()),
            Some("/-/login?return=%2Fdocs")
        );
    }
}
