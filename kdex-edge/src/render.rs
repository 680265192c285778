//! Page and navigation rendering
//!
//! Template rendering is a narrow seam: the engine hands a template plus a
//! [`RenderContext`] to a [`TemplateRenderer`] and gets HTML back. The
//! built-in [`SlotRenderer`] substitutes content slots, translations, and
//! page fields; richer engines plug in behind the same trait.
//!
//! Rendered output is cached per `(resource, language, user-hash)` in the
//! two-generation cache; stale hits are served immediately and re-rendered
//! by a detached background task with its own deadline.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::RenderCache;
use crate::decl::{HostMeta, PageBinding, ScriptRef};
use crate::error::{Error, Result};
use crate::i18n::TranslationCatalog;
use crate::identity::Identity;

/// Render cache namespace for full pages
pub const NS_PAGE: &str = "page";

/// Render cache namespace for navigation fragments
pub const NS_NAV: &str = "nav";

/// Deadline for detached background re-renders; independent of the
/// originating request's lifetime
pub const MIGRATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a renderer may draw on
pub struct RenderContext<'a> {
    pub meta: &'a HostMeta,
    pub page: &'a PageBinding,
    pub lang: &'a str,
    pub catalog: &'a TranslationCatalog,
    pub identity: Option<&'a Identity>,
    pub theme_assets: &'a [String],
}

/// Pure template → HTML seam
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, ctx: &RenderContext<'_>) -> Result<String>;
}

/// Built-in renderer: `{{…}}` placeholder substitution
///
/// Supported placeholders: `{{title}}`, `{{label}}`, `{{lang}}`,
/// `{{path}}`, `{{user}}`, `{{slot:NAME}}`, and `{{t:KEY}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotRenderer;

impl TemplateRenderer for SlotRenderer {
    fn render(&self, template: &str, ctx: &RenderContext<'_>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(Error::Render(format!(
                    "unterminated placeholder in template for page '{}'",
                    ctx.page.name
                )));
            };
            let token = after[..end].trim();
            out.push_str(&resolve_placeholder(token, ctx));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn resolve_placeholder(token: &str, ctx: &RenderContext<'_>) -> String {
    if let Some(slot) = token.strip_prefix("slot:") {
        return ctx
            .page
            .content_slots
            .get(slot)
            .cloned()
            .unwrap_or_default();
    }
    if let Some(key) = token.strip_prefix("t:") {
        return ctx
            .catalog
            .lookup(ctx.lang, key)
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string());
    }
    match token {
        "title" => ctx.meta.title.clone(),
        "label" => ctx.page.label.clone(),
        "lang" => ctx.lang.to_string(),
        "path" => ctx.page.base_path.clone(),
        "user" => ctx
            .identity
            .map(|i| i.subject.clone())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Render a full page document: the main template inside an HTML shell with
/// head/foot scripts and theme assets
pub fn render_page(renderer: &dyn TemplateRenderer, ctx: &RenderContext<'_>) -> Result<String> {
    let body = renderer.render(&ctx.page.main_template, ctx)?;
    Ok(wrap_document(ctx, &body))
}

/// Render a navigation fragment (no document shell)
pub fn render_navigation(
    renderer: &dyn TemplateRenderer,
    ctx: &RenderContext<'_>,
    nav_template: &str,
) -> Result<String> {
    renderer.render(nav_template, ctx)
}

fn script_tag(script: &ScriptRef) -> String {
    if script.defer {
        format!("<script src=\"{}\" defer></script>", script.src)
    } else {
        format!("<script src=\"{}\"></script>", script.src)
    }
}

fn wrap_document(ctx: &RenderContext<'_>, body: &str) -> String {
    let mut head = String::new();
    for asset in ctx.theme_assets {
        head.push_str(&format!("<link rel=\"stylesheet\" href=\"{asset}\">"));
    }
    for script in &ctx.page.head_scripts {
        head.push_str(&script_tag(script));
    }
    let mut foot = String::new();
    for script in &ctx.page.foot_scripts {
        foot.push_str(&script_tag(script));
    }

    let title = if ctx.page.label.is_empty() {
        ctx.meta.title.clone()
    } else if ctx.meta.title.is_empty() {
        ctx.page.label.clone()
    } else {
        format!("{} | {}", ctx.page.label, ctx.meta.title)
    };

    format!(
        "<!doctype html>\n<html lang=\"{lang}\">\n<head><meta charset=\"utf-8\"><title>{title}</title>{head}</head>\n<body>{body}{foot}</body>\n</html>\n",
        lang = ctx.lang,
    )
}

/// Cache key for a page render
pub fn page_cache_key(base_path: &str, lang: &str, user_hash: &str) -> String {
    format!("{base_path}:{lang}:{user_hash}")
}

/// Cache key for a navigation render
pub fn nav_cache_key(nav_key: &str, base_path: &str, lang: &str, user_hash: &str) -> String {
    format!("{nav_key}:{base_path}:{lang}:{user_hash}")
}

/// Re-render a stale entry off the request path
///
/// The task is detached from the originating request and bounded by
/// [`MIGRATE_TIMEOUT`]; failures only log, the stale entry stays servable.
pub fn spawn_migration(
    cache: Arc<RenderCache>,
    ns: &'static str,
    key: String,
    render: Box<dyn FnOnce() -> Result<String> + Send + 'static>,
) {
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(MIGRATE_TIMEOUT, tokio::task::spawn_blocking(render)).await;
        match outcome {
            Ok(Ok(Ok(html))) => {
                cache.set(ns, &key, html);
                tracing::debug!(ns, key = %key, "migrated stale cache entry");
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(ns, key = %key, "background re-render failed: {e}");
            }
            Ok(Err(join_error)) => {
                tracing::warn!(ns, key = %key, "background re-render panicked: {join_error}");
            }
            Err(_) => {
                tracing::warn!(ns, key = %key, "background re-render exceeded its deadline");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fixtures() -> (HostMeta, PageBinding, TranslationCatalog) {
        let meta = HostMeta {
            name: "docs".into(),
            title: "Docs Portal".into(),
            brand_color: "#336".into(),
        };
        let mut slots = BTreeMap::new();
        slots.insert("intro".to_string(), "<p>welcome</p>".to_string());
        let page = PageBinding {
            name: "docs".into(),
            base_path: "/docs".into(),
            label: "Documentation".into(),
            main_template: "<main>{{slot:intro}} {{t:greeting}} ({{lang}})</main>".into(),
            content_slots: slots,
            head_scripts: vec![ScriptRef {
                src: "/assets/app.js".into(),
                defer: true,
            }],
            ..Default::default()
        };
        let mut declared = BTreeMap::new();
        let mut en = BTreeMap::new();
        en.insert("greeting".to_string(), "Hello".to_string());
        declared.insert("en".to_string(), en);
        let catalog = TranslationCatalog::build("en", &["en".to_string()], &declared).unwrap();
        (meta, page, catalog)
    }

    #[test]
    fn test_slot_renderer_substitutions() {
        let (meta, page, catalog) = fixtures();
        let ctx = RenderContext {
            meta: &meta,
            page: &page,
            lang: "en",
            catalog: &catalog,
            identity: None,
            theme_assets: &[],
        };
        let html = SlotRenderer.render(&page.main_template, &ctx).unwrap();
        assert_eq!(html, "<main><p>welcome</p> Hello (en)</main>");
    }

    #[test]
    fn test_unterminated_placeholder_is_an_error() {
        let (meta, page, catalog) = fixtures();
        let ctx = RenderContext {
            meta: &meta,
            page: &page,
            lang: "en",
            catalog: &catalog,
            identity: None,
            theme_assets: &[],
        };
        assert!(SlotRenderer.render("broken {{t:greeting", &ctx).is_err());
    }

    #[test]
    fn test_render_page_wraps_document() {
        let (meta, page, catalog) = fixtures();
        let assets = vec!["/theme.css".to_string()];
        let ctx = RenderContext {
            meta: &meta,
            page: &page,
            lang: "en",
            catalog: &catalog,
            identity: None,
            theme_assets: &assets,
        };
        let html = render_page(&SlotRenderer, &ctx).unwrap();
        assert!(html.starts_with("<!doctype html>"));
        assert!(html.contains("<html lang=\"en\">"));
        assert!(html.contains("<title>Documentation | Docs Portal</title>"));
        assert!(html.contains("<link rel=\"stylesheet\" href=\"/theme.css\">"));
        assert!(html.contains("<script src=\"/assets/app.js\" defer></script>"));
        assert!(html.contains("<main><p>welcome</p> Hello (en)</main>"));
    }

    #[test]
    fn test_cache_keys() {
        assert_eq!(page_cache_key("/docs", "en", "anon"), "/docs:en:anon");
        assert_eq!(
            nav_cache_key("main", "/docs", "en", "anon"),
            "main:/docs:en:anon"
        );
    }

    #[tokio::test]
    async fn test_spawn_migration_writes_back() {
        let cache = Arc::new(RenderCache::new());
        cache.set(NS_NAV, "k", "old");
        cache.clear(NS_NAV);

        spawn_migration(
            Arc::clone(&cache),
            NS_NAV,
            "k".into(),
            Box::new(|| Ok("new".to_string())),
        );

        // Poll until the detached task lands the fresh entry.
        for _ in 0..100 {
            if let Some(hit) = cache.get(NS_NAV, "k") {
                if hit.is_current {
                    assert_eq!(hit.value, "new");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("migration did not complete");
    }

    #[tokio::test]
    async fn test_spawn_migration_failure_keeps_stale_entry() {
        let cache = Arc::new(RenderCache::new());
        cache.set(NS_NAV, "k", "old");
        cache.clear(NS_NAV);

        spawn_migration(
            Arc::clone(&cache),
            NS_NAV,
            "k".into(),
            Box::new(|| Err(Error::Render("boom".into()))),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hit = cache.get(NS_NAV, "k").expect("stale entry survives");
        assert!(!hit.is_current);
        assert_eq!(hit.value, "old");
    }
}
