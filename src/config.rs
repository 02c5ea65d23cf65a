// Proxy configuration
//
// Loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. TOML config file (--config, default ./banan-stats.toml)
// 3. Built-in defaults (lowest priority)
//
// Key names in the file match the historical middleware plugin keys
// (camelCase). A missing file means all defaults; a present but invalid file
// is fatal, as are a blank sidecarURL/upstreamURL and an unparseable
// flushInterval.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SameSite attribute for the tracking cookie. Unrecognized config values
/// fall back to Lax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "strict" => SameSite::Strict,
            "none" => SameSite::None,
            _ => SameSite::Lax,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Attributes of the visitor tracking cookie.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    pub path: String,
    pub domain: String,
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "stats_id".to_string(),
            path: "/".to_string(),
            domain: String::new(),
            max_age: 2147483647,
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

/// Effective proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the intercepting proxy listens on.
    pub listen: SocketAddr,
    /// Where intercepted traffic is forwarded.
    pub upstream_url: String,
    /// Base URL of the stats sidecar.
    pub sidecar_url: String,
    /// Path served as the dashboard (empty disables the dashboard proxy).
    pub dashboard_path: String,
    /// Bearer token required for the dashboard; empty = no auth.
    pub dashboard_token: String,
    pub cookie: CookieConfig,
    /// Legacy in-memory queue size; accepted but unused with the disk buffer.
    #[allow(dead_code)]
    pub queue_size: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
    /// SQLite file backing the event buffer.
    pub buffer_path: PathBuf,
    /// 0 = unbounded; otherwise enqueue blocks at this many buffered events.
    pub buffer_max_events: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().expect("default listen addr"),
            upstream_url: String::new(),
            sidecar_url: String::new(),
            dashboard_path: "/stats".to_string(),
            dashboard_token: String::new(),
            cookie: CookieConfig::default(),
            queue_size: 1024,
            flush_interval: Duration::from_secs(2),
            batch_size: 100,
            buffer_path: std::env::temp_dir().join("banan-stats-buffer.sqlite"),
            buffer_max_events: 0,
        }
    }
}

/// Config file structure. Every key is optional; None means "use default".
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    #[serde(rename = "upstreamURL")]
    upstream_url: Option<String>,
    #[serde(rename = "sidecarURL")]
    sidecar_url: Option<String>,
    dashboard_path: Option<String>,
    dashboard_token: Option<String>,
    cookie_name: Option<String>,
    cookie_path: Option<String>,
    cookie_domain: Option<String>,
    cookie_max_age: Option<i64>,
    cookie_secure: Option<bool>,
    #[serde(rename = "cookieHTTPOnly")]
    cookie_http_only: Option<bool>,
    cookie_same_site: Option<String>,
    queue_size: Option<usize>,
    flush_interval: Option<String>,
    batch_size: Option<usize>,
    buffer_path: Option<String>,
    buffer_max_events: Option<usize>,
}

impl ProxyConfig {
    /// Load configuration from file + environment. `path` of None means the
    /// default location, which may legitimately not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_path = PathBuf::from("banan-stats.toml");
        let (file_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_path, false),
        };

        let file = if file_path.exists() {
            let raw = std::fs::read_to_string(&file_path)
                .with_context(|| format!("read config {}", file_path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("parse config {}", file_path.display()))?
        } else if required {
            bail!("config file {} not found", file_path.display());
        } else {
            FileConfig::default()
        };

        Self::from_parts(file)
    }

    fn from_parts(file: FileConfig) -> Result<Self> {
        let mut cfg = ProxyConfig::default();

        if let Some(listen) = file.listen {
            cfg.listen = listen
                .parse()
                .with_context(|| format!("invalid listen address {:?}", listen))?;
        }
        if let Some(v) = file.upstream_url {
            cfg.upstream_url = v;
        }
        if let Some(v) = file.sidecar_url {
            cfg.sidecar_url = v;
        }
        if let Some(v) = file.dashboard_path {
            cfg.dashboard_path = v;
        }
        if let Some(v) = file.dashboard_token {
            cfg.dashboard_token = v;
        }
        if let Some(v) = file.cookie_name {
            cfg.cookie.name = v;
        }
        if let Some(v) = file.cookie_path {
            cfg.cookie.path = v;
        }
        if let Some(v) = file.cookie_domain {
            cfg.cookie.domain = v;
        }
        if let Some(v) = file.cookie_max_age {
            cfg.cookie.max_age = v;
        }
        if let Some(v) = file.cookie_secure {
            cfg.cookie.secure = v;
        }
        if let Some(v) = file.cookie_http_only {
            cfg.cookie.http_only = v;
        }
        if let Some(v) = file.cookie_same_site {
            cfg.cookie.same_site = SameSite::parse(&v);
        }
        if let Some(v) = file.queue_size {
            cfg.queue_size = v;
        }
        if let Some(v) = file.flush_interval {
            cfg.flush_interval = humantime::parse_duration(&v)
                .with_context(|| format!("invalid flushInterval {:?}", v))?;
        }
        if let Some(v) = file.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = file.buffer_path {
            cfg.buffer_path = PathBuf::from(v);
        }
        if let Some(v) = file.buffer_max_events {
            cfg.buffer_max_events = v;
        }

        // Environment overrides.
        if let Ok(v) = std::env::var("BANAN_STATS_LISTEN") {
            cfg.listen = v
                .parse()
                .with_context(|| format!("invalid BANAN_STATS_LISTEN {:?}", v))?;
        }
        if let Ok(v) = std::env::var("BANAN_STATS_UPSTREAM_URL") {
            cfg.upstream_url = v;
        }
        if let Ok(v) = std::env::var("BANAN_STATS_SIDECAR_URL") {
            cfg.sidecar_url = v;
        }
        if let Ok(v) = std::env::var("BANAN_STATS_BUFFER_PATH") {
            cfg.buffer_path = PathBuf::from(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.sidecar_url.trim().is_empty() {
            bail!("sidecarURL is required");
        }
        if self.upstream_url.trim().is_empty() {
            bail!("upstreamURL is required");
        }
        if self.batch_size == 0 {
            bail!("batchSize must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(raw: &str) -> FileConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = ProxyConfig::from_parts(file(
            r#"
            sidecarURL = "http://127.0.0.1:7070"
            upstreamURL = "http://127.0.0.1:3000"
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.dashboard_path, "/stats");
        assert_eq!(cfg.cookie.name, "stats_id");
        assert_eq!(cfg.cookie.path, "/");
        assert_eq!(cfg.cookie.max_age, 2147483647);
        assert!(cfg.cookie.http_only);
        assert!(!cfg.cookie.secure);
        assert_eq!(cfg.cookie.same_site, SameSite::Lax);
        assert_eq!(cfg.queue_size, 1024);
        assert_eq!(cfg.flush_interval, Duration::from_secs(2));
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.buffer_max_events, 0);
    }

    #[test]
    fn test_recognized_keys() {
        let cfg = ProxyConfig::from_parts(file(
            r#"
            listen = "0.0.0.0:9999"
            sidecarURL = "http://sidecar:7070"
            upstreamURL = "http://app:3000"
            dashboardPath = "/metrics"
            dashboardToken = "secret"
            cookieName = "visitor"
            cookieDomain = "example.com"
            cookieSecure = true
            cookieHTTPOnly = false
            cookieSameSite = "Strict"
            flushInterval = "500ms"
            batchSize = 10
            bufferPath = "/tmp/buf.sqlite"
            bufferMaxEvents = 2
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.listen.port(), 9999);
        assert_eq!(cfg.dashboard_path, "/metrics");
        assert_eq!(cfg.dashboard_token, "secret");
        assert_eq!(cfg.cookie.name, "visitor");
        assert_eq!(cfg.cookie.domain, "example.com");
        assert!(cfg.cookie.secure);
        assert!(!cfg.cookie.http_only);
        assert_eq!(cfg.cookie.same_site, SameSite::Strict);
        assert_eq!(cfg.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.buffer_path, PathBuf::from("/tmp/buf.sqlite"));
        assert_eq!(cfg.buffer_max_events, 2);
    }

    #[test]
    fn test_missing_sidecar_url_is_fatal() {
        let err = ProxyConfig::from_parts(file(r#"upstreamURL = "http://app""#))
            .unwrap_err()
            .to_string();
        assert!(err.contains("sidecarURL"), "{}", err);
    }

    #[test]
    fn test_invalid_flush_interval_is_fatal() {
        let result = ProxyConfig::from_parts(file(
            r#"
            sidecarURL = "http://sidecar"
            upstreamURL = "http://app"
            flushInterval = "soon"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_same_site_fallback() {
        assert_eq!(SameSite::parse("strict"), SameSite::Strict);
        assert_eq!(SameSite::parse("None"), SameSite::None);
        assert_eq!(SameSite::parse("bogus"), SameSite::Lax);
        assert_eq!(SameSite::parse(""), SameSite::Lax);
    }
}
