//! # kdex-edge
//!
//! Multi-tenant HTTP edge serving dynamically declared hosts. Each host is
//! backed by a [`engine::HostEngine`]: an atomically swappable route table
//! derived from declarative state (pages, functions, translations, utility
//! pages), a middleware chain (error interceptor → auth → design sniffer →
//! dispatch), a local/OIDC auth exchange, a two-generation render cache
//! with background migration, and a reverse proxy to backend functions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kdex_edge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(EdgeConfig::load()?);
//!     init_tracing(&config);
//!
//!     let registry = Arc::new(HostRegistry::new(Arc::clone(&config)));
//!     let engine = registry.get_or_create("docs.example")?;
//!     engine.set_host(
//!         HostSnapshot::default(),
//!         AuthSettings::default(),
//!         Vec::new(),
//!         None,
//!         Vec::new(),
//!     );
//!
//!     // ConnectInfo feeds the reverse proxy's X-Forwarded-For chain.
//!     let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
//!     axum::serve(
//!         listener,
//!         registry
//!             .router()
//!             .into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod decl;
pub mod engine;
pub mod error;
pub mod favicon;
pub mod gate;
pub mod i18n;
pub mod identity;
pub mod keys;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod registry;
pub mod render;
pub mod sniffer;
pub mod system;
pub mod table;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::auth::OidcProvider;
    pub use crate::cache::RenderCache;
    pub use crate::chunk::CookieChunker;
    pub use crate::config::EdgeConfig;
    pub use crate::decl::{
        AuthSettings, ClientRegistration, FunctionRegistration, FunctionState, HostMeta,
        HostSnapshot, LocalAccount, OidcSettings, PageBinding, SecurityRequirement, UtilityKind,
        UtilityPage,
    };
    pub use crate::engine::{HostEngine, Materialized};
    pub use crate::error::{Error, Result};
    pub use crate::favicon::FaviconGenerator;
    pub use crate::identity::{AuthMethod, Identity};
    pub use crate::keys::{KeyPair, KeySet};
    pub use crate::observability::init_tracing;
    pub use crate::registry::HostRegistry;
    pub use crate::render::TemplateRenderer;
    pub use crate::sniffer::{AnalysisResult, DesignSniffer, RequestSnapshot};
    pub use crate::table::{OpenApiFilter, PathInfo, PathKind};

    pub use axum::http::StatusCode;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
