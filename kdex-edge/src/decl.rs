//! Declarative host state
//!
//! These types mirror what the orchestrator control plane pushes at the
//! engine: page bindings, function registrations, translations, utility
//! pages, and the auth configuration. The engine owns exactly one
//! [`HostSnapshot`] per host and re-materializes its route table whenever a
//! declaration changes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::table::PathInfo;

/// Host-level metadata used for titles, favicons, and OpenAPI info
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMeta {
    /// Host name (virtual-host key)
    pub name: String,

    /// Human-readable title
    #[serde(default)]
    pub title: String,

    /// Brand color used by the favicon generator
    #[serde(default)]
    pub brand_color: String,
}

/// Script reference attached to a page head or foot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRef {
    /// Script source URL
    pub src: String,

    /// Whether to emit the `defer` attribute
    #[serde(default)]
    pub defer: bool,
}

/// Frontend package reference surfaced to templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageReference {
    pub name: String,
    pub version: String,
}

/// One scheme requirement: the named scheme must be satisfied for every
/// listed value (conjunction). A resource's security is a non-empty list of
/// these (disjunction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRequirement {
    /// Scheme name; `authenticated` and `bearer` are special-cased
    pub scheme: String,

    /// Scope/claim values that must all be present under the scheme
    #[serde(default)]
    pub values: Vec<String>,
}

impl SecurityRequirement {
    pub fn new(scheme: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            scheme: scheme.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Identity claim → upstream claim renames applied by the reverse proxy
/// before signing the forwarded assertion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimMappings(pub BTreeMap<String, String>);

/// A declared page and everything needed to render it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageBinding {
    /// Unique page name
    pub name: String,

    /// Canonical mount path
    pub base_path: String,

    /// Optional parameterized variant, e.g. `/docs/{slug}`
    #[serde(default)]
    pub pattern_path: Option<String>,

    /// Display label
    #[serde(default)]
    pub label: String,

    /// Navigation fragment templates keyed by navigation key
    #[serde(default)]
    pub navigations: BTreeMap<String, String>,

    /// Free-form hints forwarded to the renderer
    #[serde(default)]
    pub navigation_hints: Option<Value>,

    /// Name of the parent page, when nested
    #[serde(default)]
    pub parent_page: Option<String>,

    /// Access requirements; empty means public
    #[serde(default)]
    pub security: Vec<SecurityRequirement>,

    /// Main page template text
    pub main_template: String,

    /// Scripts injected into the document head
    #[serde(default)]
    pub head_scripts: Vec<ScriptRef>,

    /// Scripts injected before the closing body tag
    #[serde(default)]
    pub foot_scripts: Vec<ScriptRef>,

    /// Frontend packages the page depends on
    #[serde(default)]
    pub package_references: Vec<PackageReference>,

    /// Named content slots substituted into the main template
    #[serde(default)]
    pub content_slots: BTreeMap<String, String>,
}

impl PageBinding {
    /// Validate the binding before it enters the snapshot
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::BadRequest("page binding requires a name".into()));
        }
        if self.base_path.is_empty() || !self.base_path.starts_with('/') {
            return Err(Error::BadRequest(format!(
                "page '{}' requires an absolute base path",
                self.name
            )));
        }
        if let Some(pattern) = &self.pattern_path {
            if !pattern.starts_with('/') {
                return Err(Error::BadRequest(format!(
                    "page '{}' pattern path must be absolute",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Backend function lifecycle state; only `Ready` functions are mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionState {
    Pending,
    Ready,
    Failed,
}

impl Default for FunctionState {
    fn default() -> Self {
        FunctionState::Pending
    }
}

/// A declared backend function fronted by the reverse proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRegistration {
    /// Unique function name
    pub name: String,

    /// Mount path; exposed exact and as a `/`-suffixed prefix
    pub base_path: String,

    /// Upstream URL the proxy targets
    pub upstream_url: String,

    /// Lifecycle state
    #[serde(default)]
    pub state: FunctionState,

    /// Declared API, keyed by sub-path relative to the base path
    #[serde(default)]
    pub api: BTreeMap<String, PathInfo>,

    /// Access requirements; empty means public
    #[serde(default)]
    pub security: Vec<SecurityRequirement>,

    /// Claim renames applied to the forwarded assertion
    #[serde(default)]
    pub claim_mappings: Option<ClaimMappings>,
}

/// Built-in page roles a host may bind templates for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtilityKind {
    /// Served by the catch-all when the host declares nothing
    Announcement,
    /// Wraps 4xx/5xx bodies
    Error,
    /// Served when no route matches
    NotFound,
    /// Local login form
    Login,
}

/// A bound utility page template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilityPage {
    pub kind: UtilityKind,
    pub template: String,
}

/// Local account usable with the password grant and the login form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAccount {
    pub username: String,

    /// Argon2 PHC-format password hash
    pub password_hash: String,

    /// Claims granted on successful login
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// OAuth client allowed at the authorization endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,

    /// When set, the token endpoint requires it for this client
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Exact-match redirect URIs
    pub redirect_uris: Vec<String>,
}

/// Upstream OIDC provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcSettings {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,

    /// Redirect URL registered with the provider (this host's
    /// `/-/oauth/callback`)
    pub redirect_url: String,

    /// RP-initiated logout endpoint, when the provider offers one
    #[serde(default)]
    pub end_session_url: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Per-host authentication/authorization configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Local accounts
    #[serde(default)]
    pub accounts: Vec<LocalAccount>,

    /// Registered OAuth clients
    #[serde(default)]
    pub clients: Vec<ClientRegistration>,

    /// Scheme requirements granted to callers with no identity
    #[serde(default)]
    pub anonymous_entitlements: Vec<SecurityRequirement>,

    /// Upstream OIDC provider, when delegated login is configured
    #[serde(default)]
    pub oidc: Option<OidcSettings>,
}

impl AuthSettings {
    /// Find a registered client by id
    pub fn client(&self, client_id: &str) -> Option<&ClientRegistration> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    /// Find a local account by username
    pub fn account(&self, username: &str) -> Option<&LocalAccount> {
        self.accounts.iter().find(|a| a.username == username)
    }
}

/// The complete declarative state of one host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub meta: HostMeta,

    /// Pages keyed by name
    #[serde(default)]
    pub pages: BTreeMap<String, PageBinding>,

    /// Functions keyed by name
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionRegistration>,

    /// Translations: language → key → message template
    #[serde(default)]
    pub translations: BTreeMap<String, BTreeMap<String, String>>,

    /// Utility pages keyed by kind
    #[serde(default)]
    pub utility_pages: BTreeMap<UtilityKind, UtilityPage>,

    /// Host-wide package references
    #[serde(default)]
    pub package_references: Vec<PackageReference>,

    /// Theme asset URLs surfaced to templates
    #[serde(default)]
    pub theme_assets: Vec<String>,

    /// Host-wide scripts
    #[serde(default)]
    pub scripts: Vec<ScriptRef>,

    /// Baseline path info collected during reconciliation
    #[serde(default)]
    pub base_path_infos: Vec<PathInfo>,
}

impl HostSnapshot {
    /// Find a page by its canonical base path
    pub fn page_by_base_path(&self, base_path: &str) -> Option<&PageBinding> {
        self.pages.values().find(|p| p.base_path == base_path)
    }

    /// Utility page template for a kind, when bound
    pub fn utility_page(&self, kind: UtilityKind) -> Option<&UtilityPage> {
        self.utility_pages.get(&kind)
    }
}
