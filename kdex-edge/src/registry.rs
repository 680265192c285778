//! Host registry
//!
//! Maps virtual-host names to their engines with create-or-get semantics
//! and routes inbound requests by the `Host` header.

use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Router;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::EdgeConfig;
use crate::engine::HostEngine;
use crate::error::{Error, Result};

#[derive(Clone)]
struct HostEntry {
    engine: Arc<HostEngine>,
    router: Router,
}

/// Name → engine mapping shared by the whole edge
pub struct HostRegistry {
    config: Arc<EdgeConfig>,
    hosts: DashMap<String, HostEntry>,
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("hosts", &self.hosts.len())
            .finish_non_exhaustive()
    }
}

impl HostRegistry {
    pub fn new(config: Arc<EdgeConfig>) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
        }
    }

    /// Fetch a host's engine, creating it on first reference
    pub fn get_or_create(&self, name: &str) -> Result<Arc<HostEngine>> {
        match self.hosts.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().engine.clone()),
            Entry::Vacant(entry) => {
                let engine = HostEngine::new(name, Arc::clone(&self.config))?;
                let router = engine.router();
                entry.insert(HostEntry {
                    engine: Arc::clone(&engine),
                    router,
                });
                tracing::info!(host = %name, "host engine created");
                Ok(engine)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<HostEngine>> {
        self.hosts.get(name).map(|e| e.engine.clone())
    }

    /// Destroy a host's engine; returns whether one existed
    pub fn remove(&self, name: &str) -> bool {
        match self.hosts.remove(name) {
            Some((_, entry)) => {
                entry.engine.shutdown();
                tracing::info!(host = %name, "host engine removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Select an engine by a request's `Host` header value (port ignored)
    fn select(&self, host_header: &str) -> Option<HostEntry> {
        let name = host_header.split(':').next().unwrap_or(host_header);
        self.hosts.get(name).map(|entry| entry.value().clone())
    }

    /// The edge-wide router: pick the engine by vhost, then run its chain
    pub fn router(self: &Arc<Self>) -> Router {
        let registry = Arc::clone(self);
        Router::new()
            .fallback(move |req: Request| {
                let registry = Arc::clone(&registry);
                async move { registry.dispatch(req).await }
            })
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::new())
    }

    async fn dispatch(&self, req: Request) -> Response {
        let host = req
            .headers()
            .get("x-forwarded-host")
            .or_else(|| req.headers().get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let Some(entry) = self.select(host) else {
            return IntoResponse::into_response(Error::NotFound(format!(
                "unknown host '{host}'"
            )));
        };

        match entry.router.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HostRegistry {
        HostRegistry::new(Arc::new(EdgeConfig::default()))
    }

    #[test]
    fn test_create_or_get_returns_same_engine() {
        let registry = registry();
        let a = registry.get_or_create("docs.example").unwrap();
        let b = registry.get_or_create("docs.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_without_create() {
        let registry = registry();
        assert!(registry.get("docs.example").is_none());
        registry.get_or_create("docs.example").unwrap();
        assert!(registry.get("docs.example").is_some());
    }

    #[test]
    fn test_remove() {
        let registry = registry();
        registry.get_or_create("docs.example").unwrap();
        assert!(registry.remove("docs.example"));
        assert!(!registry.remove("docs.example"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_select_strips_port() {
        let registry = registry();
        registry.get_or_create("docs.example").unwrap();
        assert!(registry.select("docs.example:8443").is_some());
        assert!(registry.select("other.example").is_none());
    }
}
