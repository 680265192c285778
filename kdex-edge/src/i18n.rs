//! Translation catalog
//!
//! Messages are stored per language as templates with positional argument
//! markers `{0}`, `{1}`, …. The catalog is rebuilt from the declaration
//! snapshot on every engine rebuild and published together with the route
//! table, so a request never observes a half-built catalog.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Immutable translation catalog for one host
#[derive(Debug, Clone, Default)]
pub struct TranslationCatalog {
    default_language: String,
    languages: Vec<String>,
    messages: HashMap<String, BTreeMap<String, String>>,
}

impl TranslationCatalog {
    /// Build a catalog from declared translations
    ///
    /// Languages from configuration are always supported (pages pre-render
    /// per entry); declared languages extend the set. Empty or non-ASCII
    /// language tags and empty message keys abort the build.
    pub fn build(
        default_language: &str,
        configured: &[String],
        declared: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Self> {
        let mut languages: Vec<String> = configured.to_vec();
        if !languages.iter().any(|l| l == default_language) {
            languages.insert(0, default_language.to_string());
        }

        let mut messages: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        for (lang, table) in declared {
            if !is_valid_language_tag(lang) {
                return Err(Error::BadRequest(format!(
                    "invalid language tag '{lang}' in translations"
                )));
            }
            if table.keys().any(|k| k.is_empty()) {
                return Err(Error::BadRequest(format!(
                    "empty translation key for language '{lang}'"
                )));
            }
            if !languages.iter().any(|l| l == lang) {
                languages.push(lang.clone());
            }
            messages.insert(lang.clone(), table.clone());
        }

        Ok(Self {
            default_language: default_language.to_string(),
            languages,
            messages,
        })
    }

    /// The default language tag
    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// All supported language tags
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Whether the language is supported
    pub fn supports(&self, lang: &str) -> bool {
        self.languages.iter().any(|l| l == lang)
    }

    /// Raw message template
    pub fn lookup(&self, lang: &str, key: &str) -> Option<&str> {
        self.messages
            .get(lang)
            .and_then(|table| table.get(key))
            .map(String::as_str)
            .or_else(|| {
                // Fall back to the default language for gaps
                if lang != self.default_language {
                    self.messages
                        .get(&self.default_language)
                        .and_then(|table| table.get(key))
                        .map(String::as_str)
                } else {
                    None
                }
            })
    }

    /// Format a message, substituting positional markers with `args`
    ///
    /// Markers without a matching argument are left in place.
    pub fn format(&self, lang: &str, key: &str, args: &[&str]) -> Option<String> {
        let template = self.lookup(lang, key)?;
        let mut out = template.to_string();
        for (i, arg) in args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), arg);
        }
        Some(out)
    }

    /// Export the message table for a language, replacing each positional
    /// marker with a `{{a}}`, `{{b}}`, … placeholder for client-side
    /// substitution. `keys` restricts the export when non-empty.
    pub fn export(&self, lang: &str, keys: &[String]) -> Option<BTreeMap<String, String>> {
        let table = self.messages.get(lang)?;
        let selected: Box<dyn Iterator<Item = (&String, &String)>> = if keys.is_empty() {
            Box::new(table.iter())
        } else {
            Box::new(keys.iter().filter_map(|k| table.get_key_value(k)))
        };

        Some(
            selected
                .map(|(k, v)| (k.clone(), externalize_markers(v)))
                .collect(),
        )
    }

    /// Pick the best supported language for an `Accept-Language` header
    pub fn negotiate(&self, accept_language: Option<&str>) -> &str {
        let Some(header) = accept_language else {
            return &self.default_language;
        };
        for entry in header.split(',') {
            let tag = entry.split(';').next().unwrap_or("").trim();
            if tag.is_empty() || tag == "*" {
                continue;
            }
            if self.supports(tag) {
                return self
                    .languages
                    .iter()
                    .find(|l| l.as_str() == tag)
                    .map(String::as_str)
                    .unwrap_or(&self.default_language);
            }
            // `en-US` degrades to `en`
            if let Some(primary) = tag.split('-').next() {
                if let Some(found) = self.languages.iter().find(|l| l.as_str() == primary) {
                    return found;
                }
            }
        }
        &self.default_language
    }
}

/// Replace positional `{n}` markers with `{{a}}`, `{{b}}`, … placeholders,
/// lettered by marker index
fn externalize_markers(template: &str) -> String {
    let mut out = template.to_string();
    for i in 0..26usize {
        let marker = format!("{{{i}}}");
        if !out.contains(&marker) {
            continue;
        }
        out = out.replace(&marker, &format!("{{{{{}}}}}", placeholder_name(i)));
    }
    out
}

/// Positional placeholder names: a…z, then aa, ab, …
fn placeholder_name(i: usize) -> String {
    let mut n = i;
    let mut name = String::new();
    loop {
        name.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    name
}

/// A valid tag is non-empty ASCII alphanumerics and dashes, e.g. `en`,
/// `pt-BR`
pub fn is_valid_language_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 35
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !tag.starts_with('-')
        && !tag.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TranslationCatalog {
        let mut declared = BTreeMap::new();
        let mut en = BTreeMap::new();
        en.insert("greeting".to_string(), "Hello {0}, you have {1} items".to_string());
        en.insert("title".to_string(), "Documentation".to_string());
        declared.insert("en".to_string(), en);
        let mut de = BTreeMap::new();
        de.insert("title".to_string(), "Dokumentation".to_string());
        declared.insert("de".to_string(), de);

        TranslationCatalog::build("en", &["en".to_string(), "de".to_string()], &declared)
            .expect("catalog")
    }

    #[test]
    fn test_build_rejects_invalid_language() {
        let mut declared = BTreeMap::new();
        declared.insert("bad tag!".to_string(), BTreeMap::new());
        assert!(TranslationCatalog::build("en", &[], &declared).is_err());
    }

    #[test]
    fn test_build_rejects_empty_key() {
        let mut declared = BTreeMap::new();
        let mut en = BTreeMap::new();
        en.insert(String::new(), "oops".to_string());
        declared.insert("en".to_string(), en);
        assert!(TranslationCatalog::build("en", &[], &declared).is_err());
    }

    #[test]
    fn test_format_substitutes_positionals() {
        let c = catalog();
        assert_eq!(
            c.format("en", "greeting", &["Ada", "3"]).as_deref(),
            Some("Hello Ada, you have 3 items")
        );
    }

    #[test]
    fn test_lookup_falls_back_to_default_language() {
        let c = catalog();
        assert_eq!(
            c.lookup("de", "greeting"),
            Some("Hello {0}, you have {1} items")
        );
        assert_eq!(c.lookup("de", "title"), Some("Dokumentation"));
    }

    #[test]
    fn test_export_externalizes_markers() {
        let c = catalog();
        let table = c.export("en", &[]).expect("export");
        assert_eq!(
            table.get("greeting").map(String::as_str),
            Some("Hello {{a}}, you have {{b}} items")
        );
        assert_eq!(table.get("title").map(String::as_str), Some("Documentation"));
    }

    #[test]
    fn test_export_filters_keys() {
        let c = catalog();
        let table = c.export("en", &["title".to_string()]).expect("export");
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("title"));
    }

    #[test]
    fn test_negotiate() {
        let c = catalog();
        assert_eq!(c.negotiate(None), "en");
        assert_eq!(c.negotiate(Some("de,en;q=0.8")), "de");
        assert_eq!(c.negotiate(Some("de-AT,fr;q=0.5")), "de");
        assert_eq!(c.negotiate(Some("fr")), "en");
        assert_eq!(c.negotiate(Some("*")), "en");
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(placeholder_name(0), "a");
        assert_eq!(placeholder_name(25), "z");
        assert_eq!(placeholder_name(26), "aa");
    }
}
