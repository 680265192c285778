//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: KDEX_)
//! 2. Current working directory: ./kdex.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session cookie configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Split-cookie encryption configuration
    #[serde(default)]
    pub chunker: ChunkerConfig,

    /// Design sniffer configuration
    #[serde(default)]
    pub sniffer: SnifferConfig,

    /// Localization configuration
    #[serde(default)]
    pub i18n: I18nConfig,

    /// Reverse proxy transport configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            chunker: ChunkerConfig::default(),
            sniffer: SnifferConfig::default(),
            i18n: I18nConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl EdgeConfig {
    /// Load configuration from defaults, `./kdex.toml`, and `KDEX_*` env vars
    pub fn load() -> Result<Self> {
        let config = Figment::from(Serialized::defaults(EdgeConfig::default()))
            .merge(Toml::file("kdex.toml"))
            .merge(Env::prefixed("KDEX_").split("__"))
            .extract()?;
        Ok(config)
    }
}

/// Server-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
        }
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session token lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_secs: default_session_ttl(),
        }
    }
}

impl SessionConfig {
    /// Session token lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Split-cookie encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Base64-encoded 32-byte AES-256-GCM key. When absent, a process-wide
    /// key is generated once at startup; encrypted hints do not survive a
    /// restart in that mode.
    #[serde(default)]
    pub key: Option<String>,

    /// ID-token hint cookie lifetime in seconds
    #[serde(default = "default_hint_ttl")]
    pub hint_ttl_secs: u64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            key: None,
            hint_ttl_secs: default_hint_ttl(),
        }
    }
}

/// Design sniffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnifferConfig {
    /// Maximum number of request-body bytes captured for analysis
    #[serde(default = "default_sniffer_body_limit")]
    pub body_limit_bytes: usize,

    /// Base path the 303 Location points at; the inspect dashboard also
    /// answers under the reserved system prefix
    #[serde(default = "default_dashboard_base")]
    pub dashboard_base: String,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: default_sniffer_body_limit(),
            dashboard_base: default_dashboard_base(),
        }
    }
}

/// Localization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct I18nConfig {
    /// Default language tag
    #[serde(default = "default_language")]
    pub default_language: String,

    /// Supported language tags; pages are pre-rendered per entry
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            languages: default_languages(),
        }
    }
}

/// Reverse proxy transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// TCP keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Response-header/read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            read_timeout_secs: default_read_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    /// Upstream dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// TCP keep-alive interval
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Response read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Idle connection timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cookie_name() -> String {
    "kdex_session".to_string()
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_hint_ttl() -> u64 {
    3600
}

fn default_sniffer_body_limit() -> usize {
    64 * 1024
}

fn default_dashboard_base() -> String {
    "/inspect".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_keepalive() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    90
}
