//! Navigation fragments through the two-generation cache: current hits,
//! stale serves, and background migration

mod common;

use axum::http::StatusCode;
use common::*;
use kdex_edge::prelude::*;
use kdex_edge::render::{RenderContext, TemplateRenderer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Renderer double that stamps a render counter into its output
#[derive(Default)]
struct CountingRenderer {
    renders: AtomicUsize,
}

impl TemplateRenderer for CountingRenderer {
    fn render(&self, template: &str, _ctx: &RenderContext<'_>) -> kdex_edge::error::Result<String> {
        let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{template}#{n}"))
    }
}

fn nav_page() -> PageBinding {
    let mut page = page("docs", "/docs");
    page.navigations
        .insert("main".to_string(), "<nav>docs</nav>".to_string());
    page
}

fn counting_engine() -> (Arc<HostEngine>, axum::Router, Arc<CountingRenderer>) {
    let renderer = Arc::new(CountingRenderer::default());
    let engine = HostEngine::with_seams(
        HOST,
        config(),
        Arc::clone(&renderer) as Arc<dyn TemplateRenderer>,
        Arc::new(kdex_edge::favicon::MonogramFavicon),
    )
    .expect("engine");
    engine.set_host(
        snapshot_with_pages(vec![nav_page()]),
        AuthSettings::default(),
        Vec::new(),
        None,
        Vec::new(),
    );
    let router = engine.router();
    (engine, router, renderer)
}

#[tokio::test]
async fn navigation_renders_and_caches_per_key() {
    let (_engine, router, _renderer) = counting_engine();

    let first = router
        .clone()
        .oneshot(get("/-/navigation/main/en/docs"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_value(&first, "content-language"), Some("en"));
    let first_body = body_string(first).await;
    assert!(first_body.starts_with("<nav>docs</nav>#"));

    // second request is a current hit: the body does not change
    let second = router
        .oneshot(get("/-/navigation/main/en/docs"))
        .await
        .unwrap();
    assert_eq!(body_string(second).await, first_body);
}

#[tokio::test]
async fn stale_hit_serves_old_body_then_migrates() {
    let (engine, router, _renderer) = counting_engine();

    let primed = router
        .clone()
        .oneshot(get("/-/navigation/main/en/docs"))
        .await
        .unwrap();
    let primed_body = body_string(primed).await;

    // a declaration change bumps the cache generation
    engine.add_or_update_translation(
        "en",
        std::collections::BTreeMap::from([("title".to_string(), "Docs".to_string())]),
    );

    // the stale entry is served as-is while migration runs detached
    let stale = router
        .clone()
        .oneshot(get("/-/navigation/main/en/docs"))
        .await
        .unwrap();
    assert_eq!(stale.status(), StatusCode::OK);
    assert_eq!(body_string(stale).await, primed_body, "stale body served");

    // within the migration deadline the cache holds a fresh render
    let mut migrated = None;
    for _ in 0..200 {
        let response = router
            .clone()
            .oneshot(get("/-/navigation/main/en/docs"))
            .await
            .unwrap();
        let body = body_string(response).await;
        if body != primed_body {
            migrated = Some(body);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let migrated = migrated.expect("background migration replaced the stale entry");
    assert!(migrated.starts_with("<nav>docs</nav>#"));
}

#[tokio::test]
async fn unknown_navigation_targets_are_404() {
    let (_engine, router, _renderer) = counting_engine();

    let response = router
        .clone()
        .oneshot(get("/-/navigation/side/en/docs"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND, "unknown nav key");

    let response = router
        .clone()
        .oneshot(get("/-/navigation/main/en/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND, "unknown page");

    let response = router
        .oneshot(get("/-/navigation/main/xx/docs"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND, "unsupported language");
}

#[tokio::test]
async fn anonymous_users_share_a_cache_entry() {
    let (_engine, router, renderer) = counting_engine();

    // pre-render during rebuild plus one nav render
    let before = renderer.renders.load(Ordering::SeqCst);
    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(get("/-/navigation/main/en/docs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let after = renderer.renders.load(Ordering::SeqCst);
    assert_eq!(after - before, 1, "one render serves all anonymous callers");
}
