//! Per-host request engine
//!
//! The engine owns the declarative snapshot, its derived route table, and
//! the middleware chain serving one host. Mutators record into the snapshot
//! under the write lock, release it, and rebuild; the rebuilt table,
//! path-info map, and translation catalog publish together as one
//! [`Materialized`] value through a single atomic swap. A request loads the
//! pointer once and uses that snapshot from first lookup to dispatch, so
//! readers never see a half-built table. Rendering happens strictly outside
//! the lock.

use arc_swap::{ArcSwap, ArcSwapOption};
use axum::extract::{Request, State};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use utoipa::openapi::{OpenApi, RefOr, Schema};

use crate::auth::code::AuthCodeStore;
use crate::auth::oidc::{OidcProvider, StandardOidcProvider};
use crate::cache::RenderCache;
use crate::chunk::CookieChunker;
use crate::config::EdgeConfig;
use crate::decl::{
    AuthSettings, FunctionRegistration, FunctionState, HostSnapshot, PageBinding, UtilityKind,
    UtilityPage,
};
use crate::error::{Error, Result};
use crate::favicon::{FaviconCache, FaviconGenerator, MonogramFavicon};
use crate::i18n::TranslationCatalog;
use crate::identity::{user_hash, Identity};
use crate::keys::{KeyPair, KeySet};
use crate::middleware;
use crate::proxy::ProxyClient;
use crate::render::{
    page_cache_key, render_page, RenderContext, SlotRenderer, TemplateRenderer, NS_NAV, NS_PAGE,
};
use crate::sniffer::{AnalysisCache, DesignSniffer};
use crate::system;
use crate::table::{
    function_route, OpenApiFilter, PathInfo, PathKind, RouteTable, RouteTarget, TableBuilder,
};

/// The derived, immutable serving state of a host
pub struct Materialized {
    pub table: RouteTable,
    pub path_infos: BTreeMap<String, PathInfo>,
    pub schemas: BTreeMap<String, RefOr<Schema>>,
    pub catalog: TranslationCatalog,

    /// Monotone rebuild counter
    pub version: u64,
}

#[derive(Clone, Default)]
struct Declared {
    snapshot: HostSnapshot,
    auth: AuthSettings,
}

/// One host's request engine
pub struct HostEngine {
    name: String,
    config: Arc<EdgeConfig>,

    declared: RwLock<Declared>,
    materialized: ArcSwapOption<Materialized>,
    version: AtomicU64,

    keys: ArcSwap<KeySet>,
    pub(crate) codes: AuthCodeStore,
    pub(crate) render_cache: Arc<RenderCache>,
    pub(crate) analysis_cache: Arc<AnalysisCache>,
    pub(crate) favicon_cache: FaviconCache,
    pub(crate) chunker: CookieChunker,
    pub(crate) proxy: ProxyClient,

    renderer: Arc<dyn TemplateRenderer>,
    favicon_generator: Arc<dyn FaviconGenerator>,
    sniffer: Mutex<Option<Arc<dyn DesignSniffer>>>,
    oidc: Mutex<Option<Arc<dyn OidcProvider>>>,

    reaper_cancel: CancellationToken,
}

impl std::fmt::Debug for HostEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEngine")
            .field("name", &self.name)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HostEngine {
    /// Create an engine with the default renderer and favicon generator
    pub fn new(name: impl Into<String>, config: Arc<EdgeConfig>) -> Result<Arc<Self>> {
        Self::with_seams(name, config, Arc::new(SlotRenderer), Arc::new(MonogramFavicon))
    }

    /// Create an engine with injected renderer/favicon seams
    pub fn with_seams(
        name: impl Into<String>,
        config: Arc<EdgeConfig>,
        renderer: Arc<dyn TemplateRenderer>,
        favicon_generator: Arc<dyn FaviconGenerator>,
    ) -> Result<Arc<Self>> {
        let chunker = CookieChunker::from_config(&config.chunker)?;
        let proxy = ProxyClient::new(&config.proxy)?;

        let engine = Arc::new(Self {
            name: name.into(),
            config,
            declared: RwLock::new(Declared::default()),
            materialized: ArcSwapOption::const_empty(),
            version: AtomicU64::new(0),
            keys: ArcSwap::from_pointee(KeySet::default()),
            codes: AuthCodeStore::new(),
            render_cache: Arc::new(RenderCache::new()),
            analysis_cache: Arc::new(AnalysisCache::new()),
            favicon_cache: FaviconCache::new(),
            chunker,
            proxy,
            renderer,
            favicon_generator,
            sniffer: Mutex::new(None),
            oidc: Mutex::new(None),
            reaper_cancel: CancellationToken::new(),
        });

        // The reaper needs a runtime; engines built outside one (unit
        // tests) simply run without it.
        if tokio::runtime::Handle::try_current().is_ok() {
            engine
                .analysis_cache
                .spawn_reaper(engine.reaper_cancel.clone());
        }

        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// True once a route table has been built at least once
    pub fn ready(&self) -> bool {
        self.materialized.load().is_some()
    }

    /// The current serving state; a request loads this exactly once
    pub fn materialized(&self) -> Option<Arc<Materialized>> {
        self.materialized.load_full()
    }

    pub fn keys(&self) -> Arc<KeySet> {
        self.keys.load_full()
    }

    pub fn sniffer(&self) -> Option<Arc<dyn DesignSniffer>> {
        self.sniffer.lock().clone()
    }

    pub fn oidc_provider(&self) -> Option<Arc<dyn OidcProvider>> {
        self.oidc.lock().clone()
    }

    /// Swap the OIDC provider seam (custom providers, tests)
    pub fn set_oidc_provider(&self, provider: Option<Arc<dyn OidcProvider>>) {
        *self.oidc.lock() = provider;
    }

    /// Swap the design sniffer seam
    pub fn set_sniffer(&self, sniffer: Option<Arc<dyn DesignSniffer>>) {
        *self.sniffer.lock() = sniffer;
    }

    /// Clone of the current auth settings
    pub fn auth_settings(&self) -> AuthSettings {
        self.declared.read().auth.clone()
    }

    /// Utility page template for a kind, when bound
    pub fn utility_template(&self, kind: UtilityKind) -> Option<String> {
        self.declared
            .read()
            .snapshot
            .utility_page(kind)
            .map(|p| p.template.clone())
    }

    /// One-time authorization code store
    pub fn authorization_codes(&self) -> &AuthCodeStore {
        &self.codes
    }

    /// Renderer seam
    pub fn renderer(&self) -> &Arc<dyn TemplateRenderer> {
        &self.renderer
    }

    /// Favicon generator seam
    pub fn favicon_generator(&self) -> &Arc<dyn FaviconGenerator> {
        &self.favicon_generator
    }

    /// Stop background tasks; the engine stops serving meaningfully after
    /// this
    pub fn shutdown(&self) {
        self.reaper_cancel.cancel();
    }

    // ---- declaration mutators -------------------------------------------

    /// Replace the whole declarative state of the host
    pub fn set_host(
        &self,
        snapshot: HostSnapshot,
        auth: AuthSettings,
        functions: Vec<FunctionRegistration>,
        sniffer: Option<Arc<dyn DesignSniffer>>,
        key_pairs: Vec<KeyPair>,
    ) {
        let oidc_provider: Option<Arc<dyn OidcProvider>> = match &auth.oidc {
            Some(settings) => match StandardOidcProvider::new(settings) {
                Ok(provider) => Some(Arc::new(provider)),
                Err(e) => {
                    tracing::error!(host = %self.name, "OIDC provider rejected: {e}");
                    None
                }
            },
            None => None,
        };

        {
            let mut declared = self.declared.write();
            declared.snapshot = snapshot;
            for function in functions {
                declared
                    .snapshot
                    .functions
                    .insert(function.name.clone(), function);
            }
            declared.auth = auth;
        }
        *self.sniffer.lock() = sniffer;
        *self.oidc.lock() = oidc_provider;
        self.keys.store(Arc::new(KeySet::new(key_pairs)));
        self.favicon_cache.invalidate();

        self.rebuild();
    }

    pub fn add_or_update_page(&self, page: PageBinding) -> Result<()> {
        page.validate()?;
        {
            let mut declared = self.declared.write();
            declared.snapshot.pages.insert(page.name.clone(), page);
        }
        self.rebuild();
        Ok(())
    }

    pub fn remove_page(&self, name: &str) {
        let removed = self.declared.write().snapshot.pages.remove(name).is_some();
        if removed {
            self.rebuild();
        }
    }

    pub fn add_or_update_function(&self, function: FunctionRegistration) {
        {
            let mut declared = self.declared.write();
            declared
                .snapshot
                .functions
                .insert(function.name.clone(), function);
        }
        self.rebuild();
    }

    pub fn remove_function(&self, name: &str) {
        let removed = self
            .declared
            .write()
            .snapshot
            .functions
            .remove(name)
            .is_some();
        if removed {
            self.rebuild();
        }
    }

    pub fn add_or_update_translation(&self, lang: &str, messages: BTreeMap<String, String>) {
        {
            let mut declared = self.declared.write();
            declared
                .snapshot
                .translations
                .insert(lang.to_string(), messages);
        }
        self.rebuild();
    }

    pub fn remove_translation(&self, lang: &str) {
        let removed = self
            .declared
            .write()
            .snapshot
            .translations
            .remove(lang)
            .is_some();
        if removed {
            self.rebuild();
        }
    }

    pub fn add_or_update_utility_page(&self, page: UtilityPage) {
        {
            let mut declared = self.declared.write();
            declared.snapshot.utility_pages.insert(page.kind, page);
        }
        self.rebuild();
    }

    pub fn remove_utility_page(&self, kind: UtilityKind) {
        let removed = self
            .declared
            .write()
            .snapshot
            .utility_pages
            .remove(&kind)
            .is_some();
        if removed {
            self.rebuild();
        }
    }

    // ---- rebuild --------------------------------------------------------

    /// Re-materialize the route table from the current snapshot
    ///
    /// Holds only a read lock, and only long enough to clone the snapshot;
    /// all rendering happens on the clone. A translation build failure
    /// abandons the rebuild and leaves the previous table serving.
    pub fn rebuild(&self) {
        let declared = self.declared.read().clone();

        let catalog = match TranslationCatalog::build(
            &self.config.i18n.default_language,
            &self.config.i18n.languages,
            &declared.snapshot.translations,
        ) {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::error!(host = %self.name, "translation catalog build failed, keeping previous table: {e}");
                return;
            }
        };

        let mut builder = TableBuilder::new();

        for info in &declared.snapshot.base_path_infos {
            builder.info(&info.base_path, info.clone());
        }

        system::register_system_routes(&mut builder);

        let mut mounted_pages = 0usize;
        for page in declared.snapshot.pages.values() {
            if let Err(e) = page.validate() {
                tracing::warn!(host = %self.name, page = %page.name, "skipping invalid page binding: {e}");
                continue;
            }
            self.register_page(&mut builder, &catalog, page);
            mounted_pages += 1;
        }

        let mut mounted_functions = 0usize;
        for function in declared.snapshot.functions.values() {
            if function.state != FunctionState::Ready {
                continue;
            }
            match self.register_function(&mut builder, function) {
                Ok(()) => mounted_functions += 1,
                Err(e) => {
                    tracing::warn!(host = %self.name, function = %function.name, "skipping function: {e}");
                }
            }
        }

        if mounted_pages == 0 && mounted_functions == 0 {
            builder.route("/", RouteTarget::Announcement);
            builder.route("/{*rest}", RouteTarget::Announcement);
        }

        let (table, path_infos, schemas) = builder.finish();

        // Invalidate cached renders before warming: existing entries become
        // stale-but-servable and migrate on demand.
        self.render_cache.clear(NS_PAGE);
        self.render_cache.clear(NS_NAV);

        self.prewarm_pages(&declared.snapshot, &catalog);

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.materialized.store(Some(Arc::new(Materialized {
            table,
            path_infos,
            schemas,
            catalog,
            version,
        })));

        tracing::info!(
            host = %self.name,
            version,
            pages = mounted_pages,
            functions = mounted_functions,
            "route table published"
        );
    }

    fn register_page(
        &self,
        builder: &mut TableBuilder,
        catalog: &TranslationCatalog,
        page: &PageBinding,
    ) {
        let shared = Arc::new(page.clone());
        let info = PathInfo::new(&page.base_path, PathKind::Page)
            .with_summary(&page.label)
            .with_tag("pages")
            .with_operation("get", crate::table::simple_operation(&page.label, "pages"));

        builder.register(
            &page.base_path,
            RouteTarget::Page {
                page: Arc::clone(&shared),
                lang: None,
            },
            Some(info),
        );
        if page.base_path != "/" {
            builder.route(
                &format!("{}/", page.base_path),
                RouteTarget::Page {
                    page: Arc::clone(&shared),
                    lang: None,
                },
            );
        }

        for lang in catalog.languages() {
            builder.route(
                &format!("/{lang}{}", page.base_path),
                RouteTarget::Page {
                    page: Arc::clone(&shared),
                    lang: Some(lang.clone()),
                },
            );
        }

        if let Some(pattern) = &page.pattern_path {
            let info = PathInfo::new(pattern.clone(), PathKind::Page)
                .with_summary(&page.label)
                .with_tag("pages")
                .with_operation("get", crate::table::simple_operation(&page.label, "pages"));
            builder.register(
                pattern,
                RouteTarget::Page {
                    page: Arc::clone(&shared),
                    lang: None,
                },
                Some(info),
            );
            for lang in catalog.languages() {
                builder.route(
                    &format!("/{lang}{pattern}"),
                    RouteTarget::Page {
                        page: Arc::clone(&shared),
                        lang: Some(lang.clone()),
                    },
                );
            }
        }
    }

    fn register_function(
        &self,
        builder: &mut TableBuilder,
        function: &FunctionRegistration,
    ) -> Result<()> {
        let route = Arc::new(function_route(
            &function.name,
            &function.base_path,
            &function.upstream_url,
            &function.security,
            function.claim_mappings.as_ref(),
        )?);

        let info = PathInfo::new(&function.base_path, PathKind::Function)
            .with_summary(&function.name)
            .with_tag("functions");
        builder.register(
            &function.base_path,
            RouteTarget::Function(Arc::clone(&route)),
            Some(info),
        );
        let prefix = function.base_path.trim_end_matches('/');
        builder.route(&format!("{prefix}/"), RouteTarget::Function(Arc::clone(&route)));
        builder.route(
            &format!("{prefix}/{{*rest}}"),
            RouteTarget::Function(Arc::clone(&route)),
        );

        for (sub_path, api_info) in &function.api {
            let full = crate::proxy::path_join(&function.base_path, sub_path);
            builder.info(&full, api_info.clone());
        }
        Ok(())
    }

    /// Warm the page cache per supported language for anonymous callers;
    /// a render failure skips that language and logs
    fn prewarm_pages(&self, snapshot: &HostSnapshot, catalog: &TranslationCatalog) {
        for page in snapshot.pages.values() {
            for lang in catalog.languages() {
                let ctx = RenderContext {
                    meta: &snapshot.meta,
                    page,
                    lang,
                    catalog,
                    identity: None,
                    theme_assets: &snapshot.theme_assets,
                };
                match render_page(self.renderer.as_ref(), &ctx) {
                    Ok(html) => {
                        let key = page_cache_key(&page.base_path, lang, user_hash(None).as_str());
                        self.render_cache.set(NS_PAGE, &key, html);
                    }
                    Err(e) => {
                        tracing::warn!(
                            host = %self.name,
                            page = %page.name,
                            lang = %lang,
                            "pre-render failed, language skipped: {e}"
                        );
                    }
                }
            }
        }
    }

    // ---- serving --------------------------------------------------------

    /// The axum router serving this host: error interceptor → auth →
    /// design sniffer → route table dispatch
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(from_fn_with_state(
                Arc::clone(self),
                middleware::sniffer_middleware,
            ))
            .layer(from_fn_with_state(
                Arc::clone(self),
                middleware::auth_middleware,
            ))
            .layer(from_fn_with_state(
                Arc::clone(self),
                middleware::error_interceptor,
            ))
            .with_state(Arc::clone(self))
    }

    /// Aggregated OpenAPI document for the current table
    pub fn openapi_doc(&self, filter: &OpenApiFilter) -> Result<OpenApi> {
        let mat = self
            .materialized()
            .ok_or_else(|| Error::Internal("route table not built yet".into()))?;
        let meta = self.declared.read().snapshot.meta.clone();
        Ok(crate::table::build_openapi(
            &meta,
            &mat.path_infos,
            &mat.schemas,
            filter,
        ))
    }

    /// Host metadata clone for handlers
    pub fn host_meta(&self) -> crate::decl::HostMeta {
        self.declared.read().snapshot.meta.clone()
    }

    /// Theme assets clone for handlers
    pub fn theme_assets(&self) -> Vec<String> {
        self.declared.read().snapshot.theme_assets.clone()
    }
}

impl Drop for HostEngine {
    fn drop(&mut self) {
        self.reaper_cancel.cancel();
    }
}

/// Route-table dispatch: one atomic load per request
async fn dispatch(State(engine): State<Arc<HostEngine>>, req: Request) -> Response {
    let Some(mat) = engine.materialized() else {
        // No table has ever been built; the interceptor turns this into the
        // 404 utility flow.
        return Error::NotFound("host has no routes yet".into()).into_response();
    };

    let path = req.uri().path().to_string();
    let Some((target, params)) = mat.table.lookup(&path) else {
        return Error::NotFound(format!("no route for '{path}'")).into_response();
    };

    let identity = req.extensions().get::<Identity>().cloned();

    let result = match target {
        RouteTarget::System(route) => {
            system::handle_system(&engine, &mat, route, params, identity.as_ref(), req).await
        }
        RouteTarget::Page { page, lang } => {
            system::serve_page(&engine, &mat, &page, lang.as_deref(), identity.as_ref(), &req)
        }
        RouteTarget::Function(route) => {
            system::serve_function(&engine, &route, identity.as_ref(), req).await
        }
        RouteTarget::Announcement => system::serve_announcement(&engine, &mat).await,
    };

    result.unwrap_or_else(IntoResponse::into_response)
}
