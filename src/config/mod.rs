//! Engine configuration.
//!
//! [`EngineConfig`] is plain serde data, so it can be loaded from JSON or
//! built in code and handed to [`EngineBuilder`](crate::EngineBuilder).
//! Every field has a default; a partial document only overrides what it
//! names.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use crate::modules::not_found::NotFoundConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid seed url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyKind {
    fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub kind: ProxyKind,
}

impl ProxySettings {
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }

    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        let proxy = reqwest::Proxy::all(self.endpoint())?;
        Ok(match self.username {
            Some(ref username) => {
                proxy.basic_auth(username, self.password.as_deref().unwrap_or_default())
            }
            None => proxy,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seed URL, used when a request names no URL of its own. Embedded
    /// credentials become basic auth.
    pub url: Option<String>,
    pub max_concurrency: usize,
    pub redirect_limit: usize,
    pub request_timeout_ms: u64,
    pub user_agent: String,
    /// Adds a `From` header identifying who authorized the scan.
    pub authed_by: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    /// Seed cookies as `name=value; other=value`.
    pub cookie_string: Option<String>,
    pub proxy: Option<ProxySettings>,
    /// Undrained requests that trigger an emergency drain.
    pub max_queue_size: usize,
    pub not_found: NotFoundConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_concurrency: 20,
            redirect_limit: 20,
            request_timeout_ms: 50_000,
            user_agent: concat!("probe-engine/", env!("CARGO_PKG_VERSION")).to_string(),
            authed_by: None,
            custom_headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            cookie_string: None,
            proxy: None,
            max_queue_size: 5000,
            not_found: NotFoundConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if self.not_found.precision == 0 {
            return Err(ConfigError::Invalid("not_found.precision must be at least 1".into()));
        }
        self.seed_url()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parsed seed URL. An empty string counts as unset.
    pub fn seed_url(&self) -> Result<Option<Url>, ConfigError> {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(Some(Url::parse(url)?)),
            _ => Ok(None),
        }
    }
}
