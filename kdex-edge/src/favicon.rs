//! SVG favicon serving
//!
//! Generation is a seam ([`FaviconGenerator`]); the engine caches the
//! result with its validators and answers conditional requests with 304.
//! Regeneration under concurrent misses is benign since generation is
//! idempotent for a given host.

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;

use crate::decl::HostMeta;
use crate::error::Result;

/// SVG favicon producer
pub trait FaviconGenerator: Send + Sync {
    fn generate(&self, meta: &HostMeta) -> Result<String>;
}

/// Default generator: a rounded monogram tile in the host's brand color
#[derive(Debug, Default, Clone, Copy)]
pub struct MonogramFavicon;

impl FaviconGenerator for MonogramFavicon {
    fn generate(&self, meta: &HostMeta) -> Result<String> {
        let initial = meta
            .title
            .chars()
            .chain(meta.name.chars())
            .find(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('K');
        let color = if meta.brand_color.is_empty() {
            "#1f2430"
        } else {
            &meta.brand_color
        };
        Ok(format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 32 32\"><rect width=\"32\" height=\"32\" rx=\"6\" fill=\"{color}\"/><text x=\"16\" y=\"22\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"18\" fill=\"#fff\">{initial}</text></svg>"
        ))
    }
}

/// A generated favicon with its HTTP validators
#[derive(Debug, Clone)]
pub struct FaviconEntry {
    pub svg: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Single-slot concurrent favicon cache
#[derive(Debug, Default)]
pub struct FaviconCache {
    entry: DashMap<(), FaviconEntry>,
}

impl FaviconCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry, generating on first access
    pub fn get_or_generate(
        &self,
        generator: &dyn FaviconGenerator,
        meta: &HostMeta,
    ) -> Result<FaviconEntry> {
        if let Some(entry) = self.entry.get(&()) {
            return Ok(entry.clone());
        }
        let svg = generator.generate(meta)?;
        let etag = format!("\"{}\"", &blake3::hash(svg.as_bytes()).to_hex()[..16]);
        let entry = FaviconEntry {
            svg,
            etag,
            last_modified: Utc::now(),
        };
        self.entry.insert((), entry.clone());
        Ok(entry)
    }

    /// Drop the cached entry so the next request regenerates
    pub fn invalidate(&self) {
        self.entry.remove(&());
    }
}

/// Format a timestamp as an IMF-fixdate HTTP date
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date from a conditional header
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether a conditional request may be answered 304
///
/// `If-None-Match` wins over `If-Modified-Since` when both are present.
pub fn not_modified(
    entry: &FaviconEntry,
    if_none_match: Option<&str>,
    if_modified_since: Option<&str>,
) -> bool {
    if let Some(candidates) = if_none_match {
        return candidates
            .split(',')
            .map(str::trim)
            .any(|tag| tag == entry.etag || tag == "*");
    }
    if let Some(since) = if_modified_since.and_then(parse_http_date) {
        // HTTP dates carry second precision
        let truncated = entry
            .last_modified
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Ok(entry_secs) = DateTime::parse_from_rfc3339(&truncated) {
            return entry_secs.with_timezone(&Utc) <= since;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> HostMeta {
        HostMeta {
            name: "docs".into(),
            title: "Docs".into(),
            brand_color: "#336699".into(),
        }
    }

    #[test]
    fn test_generate_and_cache() {
        let cache = FaviconCache::new();
        let first = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        let second = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        assert_eq!(first.etag, second.etag);
        assert_eq!(first.last_modified, second.last_modified);
        assert!(first.svg.contains("#336699"));
        assert!(first.svg.contains(">D<"));
    }

    #[test]
    fn test_invalidate_regenerates() {
        let cache = FaviconCache::new();
        let first = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        cache.invalidate();
        let second = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        // same content hashes to the same etag even after regeneration
        assert_eq!(first.etag, second.etag);
    }

    #[test]
    fn test_http_date_round_trip() {
        let now = Utc::now();
        let parsed = parse_http_date(&http_date(now)).expect("parse");
        assert!((now - parsed).num_seconds().abs() <= 1);
    }

    #[test]
    fn test_not_modified_by_etag() {
        let cache = FaviconCache::new();
        let entry = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        assert!(not_modified(&entry, Some(entry.etag.as_str()), None));
        assert!(not_modified(&entry, Some("*"), None));
        assert!(!not_modified(&entry, Some("\"other\""), None));
    }

    #[test]
    fn test_not_modified_by_date() {
        let cache = FaviconCache::new();
        let entry = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        let later = http_date(entry.last_modified + chrono::Duration::seconds(5));
        let earlier = http_date(entry.last_modified - chrono::Duration::seconds(5));
        assert!(not_modified(&entry, None, Some(&later)));
        assert!(!not_modified(&entry, None, Some(&earlier)));
    }

    #[test]
    fn test_etag_wins_over_date() {
        let cache = FaviconCache::new();
        let entry = cache.get_or_generate(&MonogramFavicon, &meta()).unwrap();
        let later = http_date(entry.last_modified + chrono::Duration::seconds(5));
        assert!(!not_modified(&entry, Some("\"other\""), Some(&later)));
    }
}
