//! Design sniffer subsystem
//!
//! When a request falls through to a 404, a configured sniffer analyzes the
//! original request and infers the API operation the caller apparently
//! expected. The analysis is cached for ten minutes and the caller is
//! redirected to an inspection dashboard.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reaper tick interval
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum analysis record age before the reaper deletes it
pub const MAX_RECORD_AGE: Duration = Duration::from_secs(10 * 60);

/// Immutable copy of the original request handed to the sniffer
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,

    /// Body bytes, truncated to the configured capture limit
    pub body: Vec<u8>,

    /// True when the original body exceeded the capture limit
    pub body_truncated: bool,
}

impl RequestSnapshot {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A single finding attached to an analysis
#[derive(Debug, Clone, Serialize)]
pub struct Lint {
    pub code: String,
    pub message: String,
}

/// What the sniffer inferred from a missed request
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Path the operation should mount at
    pub base_path: String,

    /// HTTP method of the inferred operation
    pub method: String,

    /// Draft OpenAPI operation
    pub operation: serde_json::Value,

    pub lints: Vec<Lint>,
}

/// Pluggable request analyzer
pub trait DesignSniffer: Send + Sync {
    /// Analyze a missed request; `None` leaves the 404 untouched
    fn analyze(&self, request: &RequestSnapshot) -> Option<AnalysisResult>;
}

/// A stored analysis
#[derive(Debug)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub request: RequestSnapshot,
    pub analysis: AnalysisResult,
    pub created_at: DateTime<Utc>,
}

/// Lock-free analysis store with age-based reaping
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: DashMap<Uuid, Arc<AnalysisRecord>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an analysis under a fresh id
    pub fn insert(&self, request: RequestSnapshot, analysis: AnalysisResult) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            Arc::new(AnalysisRecord {
                id,
                request,
                analysis,
                created_at: Utc::now(),
            }),
        );
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<AnalysisRecord>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Delete records older than `max_age`
    pub fn reap(&self, max_age: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.entries.len();
        self.entries.retain(|_, record| record.created_at > cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "reaped expired analysis records");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the reaper until cancelled
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => cache.reap(MAX_RECORD_AGE),
                }
            }
            tracing::debug!("analysis reaper stopped");
        });
    }
}

/// CLI user agents that get a text-format dashboard link
const CLI_AGENTS: [&str; 3] = ["curl", "wget", "httpie"];

/// Whether the caller should get `format=text`
pub fn wants_text(user_agent: Option<&str>, accept: Option<&str>) -> bool {
    if let Some(ua) = user_agent {
        let ua = ua.to_ascii_lowercase();
        if CLI_AGENTS.iter().any(|agent| ua.contains(agent)) {
            return true;
        }
    }
    accept.is_some_and(|a| a.contains("text/plain"))
}

/// OSC-8 terminal hyperlink
pub fn osc8_link(url: &str, label: &str) -> String {
    format!("\x1b]8;;{url}\x1b\\{label}\x1b]8;;\x1b\\")
}

/// Plain-text fallback body for the 303 handoff
pub fn redirect_body(inspect_url: &str) -> String {
    format!(
        "➔ API Draft Created\n\nNo route matched your request, so a draft API operation was\ninferred from it. Inspect and refine it here:\n\n  {}\n",
        osc8_link(inspect_url, inspect_url)
    )
}

/// Text-format dashboard
pub fn render_text(record: &AnalysisRecord, absolute_url: &str) -> String {
    let mut out = String::new();
    out.push_str("➔ API Draft Created\n\n");
    out.push_str(&format!(
        "  {} {}\n",
        record.analysis.method, record.analysis.base_path
    ));
    out.push_str(&format!("  captured {}\n\n", record.created_at.to_rfc3339()));
    if record.request.body_truncated {
        out.push_str("  note: request body was truncated at the capture limit\n\n");
    }
    if !record.analysis.lints.is_empty() {
        out.push_str("Lints:\n");
        for lint in &record.analysis.lints {
            out.push_str(&format!("  [{}] {}\n", lint.code, lint.message));
        }
        out.push('\n');
    }
    out.push_str("Draft operation:\n");
    out.push_str(
        &serde_json::to_string_pretty(&record.analysis.operation)
            .unwrap_or_else(|_| "{}".to_string()),
    );
    out.push('\n');
    out.push_str(&format!("\n{}\n", osc8_link(absolute_url, "open in browser")));
    out
}

/// HTML dashboard
pub fn render_html(record: &AnalysisRecord) -> String {
    let lints: String = record
        .analysis
        .lints
        .iter()
        .map(|l| {
            format!(
                "<li><code>{}</code> {}</li>",
                escape_html(&l.code),
                escape_html(&l.message)
            )
        })
        .collect();
    let operation = serde_json::to_string_pretty(&record.analysis.operation)
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "<!doctype html>\n<html><head><title>API Draft {}</title></head><body>\n<h1>API Draft Created</h1>\n<p><code>{} {}</code> captured {}</p>\n<ul>{}</ul>\n<pre>{}</pre>\n</body></html>\n",
        record.id,
        escape_html(&record.analysis.method),
        escape_html(&record.analysis.base_path),
        record.created_at.to_rfc3339(),
        lints,
        escape_html(&operation),
    )
}

/// Documentation served at `/-/sniffer/docs`
pub const SNIFFER_DOCS: &str = "# Design Sniffer\n\nWhen a request misses every route, the edge analyzes it and drafts the\nOpenAPI operation it appears to target. The caller receives a `303 See\nOther` pointing at an inspection dashboard.\n\n## Headers\n\n| Header | Direction | Meaning |\n|---|---|---|\n| `X-KDex-Sniffer-Docs` | response | Absolute URL of this document, emitted on every sniffer redirect. |\n| `User-Agent` | request | CLI tools (`curl`, `wget`, `httpie`) are redirected to the text dashboard. |\n| `Accept` | request | `text/plain` also selects the text dashboard. |\n\n## Dashboard\n\n`GET /-/sniffer/inspect/{id}?format=text|html` renders the stored\nanalysis. Records expire ten minutes after capture.\n";

/// Minimal HTML escaping for dashboard interpolation
pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            method: "GET".into(),
            path: "/widgets".into(),
            query: None,
            headers: vec![("User-Agent".into(), "curl/8".into())],
            body: Vec::new(),
            body_truncated: false,
        }
    }

    fn analysis() -> AnalysisResult {
        AnalysisResult {
            base_path: "/widgets".into(),
            method: "GET".into(),
            operation: json!({"summary": "List widgets"}),
            lints: vec![Lint {
                code: "no-auth".into(),
                message: "operation has no security requirement".into(),
            }],
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = AnalysisCache::new();
        let id = cache.insert(snapshot(), analysis());
        let record = cache.get(&id).expect("record");
        assert_eq!(record.analysis.base_path, "/widgets");
        assert!(cache.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_reap_only_removes_old_records() {
        let cache = AnalysisCache::new();
        cache.insert(snapshot(), analysis());
        cache.reap(MAX_RECORD_AGE);
        assert_eq!(cache.len(), 1);
        cache.reap(Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_wants_text() {
        assert!(wants_text(Some("curl/8.4.0"), None));
        assert!(wants_text(Some("Wget/1.21"), None));
        assert!(wants_text(Some("HTTPie/3.2"), None));
        assert!(wants_text(None, Some("text/plain, */*")));
        assert!(!wants_text(Some("Mozilla/5.0"), Some("text/html")));
        assert!(!wants_text(None, None));
    }

    #[test]
    fn test_render_text_contains_marker_and_hyperlink() {
        let cache = AnalysisCache::new();
        let id = cache.insert(snapshot(), analysis());
        let record = cache.get(&id).unwrap();
        let text = render_text(&record, "http://docs.example/inspect/x");
        assert!(text.contains("➔ API Draft Created"));
        assert!(text.contains("\x1b]8;;http://docs.example/inspect/x"));
        assert!(text.contains("[no-auth]"));
    }

    #[test]
    fn test_render_html_escapes() {
        let cache = AnalysisCache::new();
        let mut bad = analysis();
        bad.base_path = "/a<b>".into();
        let id = cache.insert(snapshot(), bad);
        let record = cache.get(&id).unwrap();
        let html = render_html(&record);
        assert!(html.contains("/a&lt;b&gt;"));
        assert!(!html.contains("<b>"));
    }

    #[test]
    fn test_redirect_body() {
        let body = redirect_body("http://h/inspect/1?format=text");
        assert!(body.contains("➔ API Draft Created"));
        assert!(body.contains("\x1b]8;;"));
    }
}
