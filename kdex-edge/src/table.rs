//! Route table builder
//!
//! The route table is an immutable value: a radix-matched `(pattern →
//! target)` map plus a parallel `(path → PathInfo)` map projecting every
//! registered path into OpenAPI. Tables are built off to the side on every
//! declaration change and published with a single atomic swap; readers never
//! observe a half-built table.

use matchit::Router as PatternRouter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::openapi::info::InfoBuilder;
use utoipa::openapi::path::{HttpMethod, PathItemBuilder, PathsBuilder};
use utoipa::openapi::schema::ComponentsBuilder;
use utoipa::openapi::{OpenApi, OpenApiBuilder, RefOr, Schema};

use crate::decl::{ClaimMappings, HostMeta, PageBinding, SecurityRequirement};
use crate::error::{Error, Result};

/// Origin of a registered path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PathKind {
    System,
    Page,
    Function,
    Backend,
}

impl PathKind {
    /// Parse a `?type=` filter value, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SYSTEM" => Some(PathKind::System),
            "PAGE" => Some(PathKind::Page),
            "FUNCTION" => Some(PathKind::Function),
            "BACKEND" => Some(PathKind::Backend),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::System => "SYSTEM",
            PathKind::Page => "PAGE",
            PathKind::Function => "FUNCTION",
            PathKind::Backend => "BACKEND",
        }
    }
}

/// OpenAPI projection of one registered path
///
/// Operations are keyed by lowercase HTTP method name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathInfo {
    pub base_path: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    pub kind: PathKind,

    #[serde(default)]
    pub operations: BTreeMap<String, utoipa::openapi::path::Operation>,

    #[serde(default)]
    pub schemas: BTreeMap<String, RefOr<Schema>>,
}

impl PathInfo {
    pub fn new(base_path: impl Into<String>, kind: PathKind) -> Self {
        Self {
            base_path: base_path.into(),
            summary: String::new(),
            description: String::new(),
            tags: Vec::new(),
            kind,
            operations: BTreeMap::new(),
            schemas: BTreeMap::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_operation(
        mut self,
        method: &str,
        operation: utoipa::openapi::path::Operation,
    ) -> Self {
        self.operations
            .insert(method.to_ascii_lowercase(), operation);
        self
    }

    /// Merge a later registration into this one
    ///
    /// A non-empty operation in the source replaces the destination's
    /// operation for the same method; operations on other methods are
    /// preserved. For metadata the first non-empty value wins. Colliding
    /// schema names keep the destination's entry and re-key the newcomer
    /// with a `_conflict_` suffix derived from the path.
    pub fn merge_from(&mut self, other: &PathInfo, path: &str) {
        for (method, operation) in &other.operations {
            self.operations.insert(method.clone(), operation.clone());
        }

        if self.base_path.is_empty() {
            self.base_path = other.base_path.clone();
        }
        if self.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if self.description.is_empty() {
            self.description = other.description.clone();
        }
        for tag in &other.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }

        for (name, schema) in &other.schemas {
            match self.schemas.get(name) {
                None => {
                    self.schemas.insert(name.clone(), schema.clone());
                }
                Some(existing) if schema_eq(existing, schema) => {}
                Some(_) => {
                    self.schemas
                        .insert(format!("{name}_conflict_{}", slug(path)), schema.clone());
                }
            }
        }
    }
}

fn schema_eq(a: &RefOr<Schema>, b: &RefOr<Schema>) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

/// Built-in handlers mounted on every host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRoute {
    Favicon,
    OidcDiscovery,
    OauthMetadata,
    Jwks,
    Login,
    Logout,
    Authorize,
    Callback,
    Token,
    State,
    OpenApi,
    Schema,
    Navigation,
    Translation,
    SnifferInspect,
    SnifferDocs,
}

/// Reverse-proxy target derived from a ready function registration
#[derive(Debug, Clone)]
pub struct FunctionRoute {
    pub name: String,
    pub base_path: String,

    /// Parsed once at table build
    pub upstream: reqwest::Url,

    pub security: Vec<SecurityRequirement>,
    pub claim_mappings: ClaimMappings,
}

/// What a matched pattern dispatches to
#[derive(Debug, Clone)]
pub enum RouteTarget {
    System(SystemRoute),

    /// A declared page; `lang` is fixed for localized-prefix variants
    Page {
        page: Arc<PageBinding>,
        lang: Option<String>,
    },

    Function(Arc<FunctionRoute>),

    /// Catch-all serving the announcement utility page
    Announcement,
}

/// Immutable pattern → target map
pub struct RouteTable {
    router: PatternRouter<RouteTarget>,
    patterns: Vec<String>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl RouteTable {
    fn new() -> Self {
        Self {
            router: PatternRouter::new(),
            patterns: Vec::new(),
        }
    }

    fn insert(&mut self, pattern: &str, target: RouteTarget) {
        match self.router.insert(pattern, target) {
            Ok(()) => self.patterns.push(pattern.to_string()),
            Err(e) => {
                // First registration wins; a clash is a declaration bug, not
                // a reason to drop the whole rebuild.
                tracing::warn!(pattern = %pattern, error = %e, "route pattern conflict, keeping first registration");
            }
        }
    }

    /// Match a request path, returning the target and captured parameters
    pub fn lookup(&self, path: &str) -> Option<(RouteTarget, BTreeMap<String, String>)> {
        let matched = self.router.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((matched.value.clone(), params))
    }

    /// Registered patterns, in registration order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Accumulates routes and path projections for one rebuild
pub struct TableBuilder {
    table: RouteTable,
    infos: BTreeMap<String, PathInfo>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self {
            table: RouteTable::new(),
            infos: BTreeMap::new(),
        }
    }

    /// Register a dispatch pattern without an OpenAPI projection
    pub fn route(&mut self, pattern: &str, target: RouteTarget) {
        self.table.insert(pattern, target);
    }

    /// Merge a path projection; first registration creates, later ones merge
    pub fn info(&mut self, path: &str, info: PathInfo) {
        let key = normalize_openapi_path(path);
        match self.infos.get_mut(&key) {
            Some(existing) => existing.merge_from(&info, &key),
            None => {
                self.infos.insert(key, info);
            }
        }
    }

    /// Register a pattern with its projection in one step
    pub fn register(&mut self, pattern: &str, target: RouteTarget, info: Option<PathInfo>) {
        self.route(pattern, target);
        if let Some(info) = info {
            self.info(pattern, info);
        }
    }

    /// Finish the build: the table, the path-info map, and the aggregated
    /// schema registry (collisions re-keyed with a `_conflict_` suffix)
    pub fn finish(
        self,
    ) -> (
        RouteTable,
        BTreeMap<String, PathInfo>,
        BTreeMap<String, RefOr<Schema>>,
    ) {
        let mut schemas: BTreeMap<String, RefOr<Schema>> = BTreeMap::new();
        for (path, info) in &self.infos {
            for (name, schema) in &info.schemas {
                match schemas.get(name) {
                    None => {
                        schemas.insert(name.clone(), schema.clone());
                    }
                    Some(existing) if schema_eq(existing, schema) => {}
                    Some(_) => {
                        schemas
                            .insert(format!("{name}_conflict_{}", slug(path)), schema.clone());
                    }
                }
            }
        }
        (self.table, self.infos, schemas)
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a function route, parsing the upstream URL once
pub fn function_route(
    name: &str,
    base_path: &str,
    upstream_url: &str,
    security: &[SecurityRequirement],
    claim_mappings: Option<&ClaimMappings>,
) -> Result<FunctionRoute> {
    let upstream = reqwest::Url::parse(upstream_url).map_err(|e| {
        Error::BadRequest(format!("function '{name}' has an invalid upstream URL: {e}"))
    })?;
    Ok(FunctionRoute {
        name: name.to_string(),
        base_path: base_path.to_string(),
        upstream,
        security: security.to_vec(),
        claim_mappings: claim_mappings.cloned().unwrap_or_default(),
    })
}

/// Normalize a route pattern into its OpenAPI path: wildcard parameters
/// `{*name}` collapse to `{name}`
pub fn normalize_openapi_path(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("{*") {
        out.push_str(&rest[..start]);
        out.push('{');
        rest = &rest[start + 2..];
    }
    out.push_str(rest);
    out
}

/// Path slug for conflict suffixes: alphanumerics preserved, the rest
/// collapses to underscores
pub fn slug(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_underscore = true;
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Filters accepted by the aggregated OpenAPI endpoint
#[derive(Debug, Clone, Default)]
pub struct OpenApiFilter {
    pub paths: Vec<String>,
    pub tags: Vec<String>,
    pub kinds: Vec<PathKind>,
}

impl OpenApiFilter {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.tags.is_empty() && self.kinds.is_empty()
    }

    fn matches(&self, path: &str, info: &PathInfo) -> bool {
        if !self.paths.is_empty() && !self.paths.iter().any(|p| p == path) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| info.tags.contains(t)) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&info.kind) {
            return false;
        }
        true
    }
}

/// Build the aggregated OpenAPI 3 document from the path-info map
///
/// Paths emit in map order, so re-invocation over the same declarations is
/// byte-stable.
pub fn build_openapi(
    meta: &HostMeta,
    infos: &BTreeMap<String, PathInfo>,
    schemas: &BTreeMap<String, RefOr<Schema>>,
    filter: &OpenApiFilter,
) -> OpenApi {
    let mut paths = PathsBuilder::new();

    for (path, info) in infos {
        if !filter.matches(path, info) {
            continue;
        }
        if info.operations.is_empty() {
            continue;
        }
        let mut item = PathItemBuilder::new();
        for (method, operation) in &info.operations {
            let Some(method) = http_method(method) else {
                tracing::warn!(path = %path, method = %method, "skipping operation with unknown method");
                continue;
            };
            item = item.operation(method, operation.clone());
        }
        paths = paths.path(path.clone(), item.build());
    }

    let mut components = ComponentsBuilder::new();
    for (name, schema) in schemas {
        components = components.schema(name.clone(), schema.clone());
    }

    let title = if meta.title.is_empty() {
        meta.name.clone()
    } else {
        meta.title.clone()
    };
    let info = InfoBuilder::new()
        .title(title)
        .version(env!("CARGO_PKG_VERSION"))
        .build();

    OpenApiBuilder::new()
        .info(info)
        .paths(paths.build())
        .components(Some(components.build()))
        .build()
}

fn http_method(name: &str) -> Option<HttpMethod> {
    match name.to_ascii_lowercase().as_str() {
        "get" => Some(HttpMethod::Get),
        "put" => Some(HttpMethod::Put),
        "post" => Some(HttpMethod::Post),
        "delete" => Some(HttpMethod::Delete),
        "options" => Some(HttpMethod::Options),
        "head" => Some(HttpMethod::Head),
        "patch" => Some(HttpMethod::Patch),
        "trace" => Some(HttpMethod::Trace),
        _ => None,
    }
}

/// Convenience constructor for system-route operations
pub fn simple_operation(summary: &str, tag: &str) -> utoipa::openapi::path::Operation {
    utoipa::openapi::path::OperationBuilder::new()
        .summary(Some(summary.to_string()))
        .tag(tag.to_string())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::openapi::schema::ObjectBuilder;

    fn object_schema(desc: &str) -> RefOr<Schema> {
        RefOr::T(Schema::Object(
            ObjectBuilder::new().description(Some(desc.to_string())).build(),
        ))
    }

    fn info_with_op(method: &str, summary: &str) -> PathInfo {
        PathInfo::new("/things", PathKind::Function)
            .with_operation(method, simple_operation(summary, "things"))
    }

    #[test]
    fn test_lookup_with_params() {
        let mut builder = TableBuilder::new();
        builder.route(
            "/-/navigation/{nav_key}/{l10n}/{*base_path}",
            RouteTarget::System(SystemRoute::Navigation),
        );
        let (table, _, _) = builder.finish();

        let (target, params) = table.lookup("/-/navigation/main/en/docs/intro").expect("match");
        assert!(matches!(target, RouteTarget::System(SystemRoute::Navigation)));
        assert_eq!(params.get("nav_key").map(String::as_str), Some("main"));
        assert_eq!(params.get("l10n").map(String::as_str), Some("en"));
        assert_eq!(params.get("base_path").map(String::as_str), Some("docs/intro"));
    }

    #[test]
    fn test_conflicting_pattern_keeps_first() {
        let mut builder = TableBuilder::new();
        builder.route("/x", RouteTarget::System(SystemRoute::OpenApi));
        builder.route("/x", RouteTarget::Announcement);
        let (table, _, _) = builder.finish();
        let (target, _) = table.lookup("/x").expect("match");
        assert!(matches!(target, RouteTarget::System(SystemRoute::OpenApi)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_operation_merge_replaces_same_method_keeps_others() {
        let mut builder = TableBuilder::new();
        builder.info("/things", info_with_op("get", "first"));
        builder.info(
            "/things",
            info_with_op("post", "create").with_operation("get", simple_operation("second", "things")),
        );
        let (_, infos, _) = builder.finish();

        let info = infos.get("/things").expect("info");
        assert_eq!(info.operations.len(), 2);
        assert_eq!(
            info.operations.get("get").and_then(|o| o.summary.clone()),
            Some("second".to_string())
        );
        assert_eq!(
            info.operations.get("post").and_then(|o| o.summary.clone()),
            Some("create".to_string())
        );
    }

    #[test]
    fn test_metadata_first_non_empty_wins() {
        let mut builder = TableBuilder::new();
        let mut first = PathInfo::new("/things", PathKind::Function);
        first.summary = "original".into();
        builder.info("/things", first);

        let mut second = PathInfo::new("/things", PathKind::Function);
        second.summary = "override attempt".into();
        second.description = "fills the gap".into();
        builder.info("/things", second);

        let (_, infos, _) = builder.finish();
        let info = infos.get("/things").unwrap();
        assert_eq!(info.summary, "original");
        assert_eq!(info.description, "fills the gap");
    }

    #[test]
    fn test_schema_conflict_rename() {
        let mut builder = TableBuilder::new();
        let mut a = PathInfo::new("/a", PathKind::Function);
        a.schemas.insert("Widget".into(), object_schema("first shape"));
        builder.info("/a", a);

        let mut b = PathInfo::new("/b/c", PathKind::Function);
        b.schemas.insert("Widget".into(), object_schema("second shape"));
        builder.info("/b/c", b);

        let (_, _, schemas) = builder.finish();
        assert!(schemas.contains_key("Widget"));
        assert!(schemas.contains_key("Widget_conflict_b_c"));
    }

    #[test]
    fn test_identical_schema_does_not_conflict() {
        let mut builder = TableBuilder::new();
        let mut a = PathInfo::new("/a", PathKind::Function);
        a.schemas.insert("Widget".into(), object_schema("same"));
        builder.info("/a", a);

        let mut b = PathInfo::new("/b", PathKind::Function);
        b.schemas.insert("Widget".into(), object_schema("same"));
        builder.info("/b", b);

        let (_, _, schemas) = builder.finish();
        assert_eq!(schemas.len(), 1);
    }

    #[test]
    fn test_normalize_openapi_path() {
        assert_eq!(normalize_openapi_path("/a/{*rest}"), "/a/{rest}");
        assert_eq!(normalize_openapi_path("/a/{id}/b"), "/a/{id}/b");
        assert_eq!(
            normalize_openapi_path("/{*x}/and/{*y}"),
            "/{x}/and/{y}"
        );
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("/b/c"), "b_c");
        assert_eq!(slug("/docs/{slug}"), "docs_slug");
        assert_eq!(slug("///"), "");
    }

    #[test]
    fn test_build_openapi_is_idempotent_and_ordered() {
        let mut builder = TableBuilder::new();
        builder.info("/zeta", info_with_op("get", "z"));
        builder.info("/alpha", info_with_op("get", "a"));
        let (_, infos, schemas) = builder.finish();

        let meta = HostMeta {
            name: "docs".into(),
            title: "Docs".into(),
            brand_color: String::new(),
        };
        let doc1 = build_openapi(&meta, &infos, &schemas, &OpenApiFilter::default());
        let doc2 = build_openapi(&meta, &infos, &schemas, &OpenApiFilter::default());
        assert_eq!(
            serde_json::to_string(&doc1).unwrap(),
            serde_json::to_string(&doc2).unwrap()
        );

        let json = serde_json::to_value(&doc1).unwrap();
        let paths: Vec<&String> = json["paths"].as_object().unwrap().keys().collect();
        assert_eq!(paths, vec!["/alpha", "/zeta"]);
    }

    #[test]
    fn test_openapi_filters() {
        let mut builder = TableBuilder::new();
        builder.info("/a", info_with_op("get", "a"));
        let mut sys = PathInfo::new("/-/openapi", PathKind::System).with_tag("system");
        sys = sys.with_operation("get", simple_operation("spec", "system"));
        builder.info("/-/openapi", sys);
        let (_, infos, schemas) = builder.finish();
        let meta = HostMeta::default();

        let filter = OpenApiFilter {
            kinds: vec![PathKind::System],
            ..Default::default()
        };
        let doc = build_openapi(&meta, &infos, &schemas, &filter);
        let json = serde_json::to_value(&doc).unwrap();
        let paths = json["paths"].as_object().unwrap();
        assert!(paths.contains_key("/-/openapi"));
        assert!(!paths.contains_key("/a"));

        let filter = OpenApiFilter {
            paths: vec!["/a".into()],
            ..Default::default()
        };
        let doc = build_openapi(&meta, &infos, &schemas, &filter);
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["paths"].as_object().unwrap().contains_key("/a"));
        assert_eq!(json["paths"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_function_route_parses_upstream_once() {
        let route = function_route("search", "/search", "http://search.internal:9200/api", &[], None)
            .expect("route");
        assert_eq!(route.upstream.host_str(), Some("search.internal"));
        assert!(function_route("bad", "/bad", "not a url", &[], None).is_err());
    }
}
