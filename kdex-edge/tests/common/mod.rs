#![allow(dead_code)]

//! Shared fixtures for the integration tests

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHasher};
use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;

use kdex_edge::prelude::*;

pub const HOST: &str = "docs.example";

pub fn config() -> Arc<EdgeConfig> {
    Arc::new(EdgeConfig::default())
}

pub fn page(name: &str, base_path: &str) -> PageBinding {
    PageBinding {
        name: name.to_string(),
        base_path: base_path.to_string(),
        label: name.to_string(),
        main_template: format!("<main>{name}</main>"),
        ..Default::default()
    }
}

pub fn secured_page(name: &str, base_path: &str, scheme: &str) -> PageBinding {
    let mut page = page(name, base_path);
    page.security = vec![SecurityRequirement::new(scheme, Vec::<String>::new())];
    page
}

pub fn snapshot_with_pages(pages: Vec<PageBinding>) -> HostSnapshot {
    let mut snapshot = HostSnapshot {
        meta: HostMeta {
            name: HOST.to_string(),
            title: "Docs".to_string(),
            brand_color: String::new(),
        },
        ..Default::default()
    };
    for page in pages {
        snapshot.pages.insert(page.name.clone(), page);
    }
    snapshot
}

pub fn password_hash(password: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .expect("hash")
        .to_string()
}

pub fn auth_with_account(username: &str, password: &str) -> AuthSettings {
    AuthSettings {
        accounts: vec![LocalAccount {
            username: username.to_string(),
            password_hash: password_hash(password),
            claims: serde_json::Map::new(),
        }],
        clients: vec![ClientRegistration {
            client_id: "portal".to_string(),
            client_secret: None,
            redirect_uris: vec!["https://portal.example/cb".to_string()],
        }],
        ..Default::default()
    }
}

/// Engine + router serving the given declarations
pub fn engine_with(snapshot: HostSnapshot, auth: AuthSettings) -> (Arc<HostEngine>, Router) {
    let engine = HostEngine::new(HOST, config()).expect("engine");
    engine.set_host(snapshot, auth, Vec::new(), None, Vec::new());
    let router = engine.router();
    (engine, router)
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::HOST, HOST)
        .body(Body::empty())
        .expect("request")
}

pub fn get_with_headers(path: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(path).header(header::HOST, HOST);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request")
}

pub fn post_form(path: &str, form: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .expect("request")
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).to_string()
}

pub fn header_value<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// Turn a response's `Set-Cookie` headers into a `Cookie` request header
pub fn cookie_header(response: &Response) -> String {
    set_cookies(response)
        .iter()
        .filter_map(|c| c.split(';').next().map(str::to_string))
        .collect::<Vec<_>>()
        .join("; ")
}
