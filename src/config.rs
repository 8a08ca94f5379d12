//! Configuration management for Slidegate.

use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{parse_trusted_proxy, KeyDeriver, ResponseHeaders};

/// Prefix for environment variable overrides, e.g. `SLIDEGATE__SERVER__UPSTREAM`.
pub const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for the Slidegate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL requests are forwarded to
    #[serde(default)]
    pub upstream: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Request attribute a rate limit key is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One key for every request
    Fixed,
    /// Connection peer address
    Ip,
    /// Client address declared by upstream proxies
    RealIp,
    /// Request path
    Path,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum requests per window
    #[serde(default = "default_request_limit")]
    pub request_limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Attributes composing the key, in order
    #[serde(default = "default_key_by")]
    pub key_by: Vec<KeyStrategy>,

    /// Key used by the `fixed` strategy
    #[serde(default = "default_fixed_key")]
    pub fixed_key: String,

    /// Rate limit header names
    #[serde(default)]
    pub headers: ResponseHeaders,

    /// Proxies allowed to declare the client address, as networks or single
    /// addresses; empty trusts every peer
    #[serde(default, deserialize_with = "deserialize_trusted_proxies")]
    pub trusted_proxies: Vec<IpNet>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            window_secs: default_window_secs(),
            key_by: default_key_by(),
            fixed_key: default_fixed_key(),
            headers: ResponseHeaders::default(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_request_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_key_by() -> Vec<KeyStrategy> {
    vec![KeyStrategy::RealIp]
}

fn default_fixed_key() -> String {
    "*".to_string()
}

fn deserialize_trusted_proxies<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<IpNet>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|entry| parse_trusted_proxy(entry).map_err(serde::de::Error::custom))
        .collect()
}

impl RateLimitingConfig {
    /// Window length as a duration.
    pub fn window_length(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Key derivers for the configured strategies.
    pub fn key_derivers(&self) -> Vec<KeyDeriver> {
        self.key_by
            .iter()
            .map(|strategy| match strategy {
                KeyStrategy::Fixed => KeyDeriver::fixed(self.fixed_key.clone()),
                KeyStrategy::Ip => KeyDeriver::by_ip(),
                KeyStrategy::RealIp => KeyDeriver::by_real_ip_from(self.trusted_proxies.clone()),
                KeyStrategy::Path => KeyDeriver::by_path(),
            })
            .collect()
    }
}

impl SlidegateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SlidegateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then `SLIDEGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SlidegateError::Config(e.to_string()))
    }

    /// Check the configuration for values the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.server.upstream.as_deref() {
            None | Some("") => {
                return Err(SlidegateError::UpstreamParse(
                    "no upstream URL configured".to_string(),
                ))
            }
            Some(_) => {}
        }
        if self.rate_limiting.request_limit == 0 {
            return Err(SlidegateError::Config(
                "request_limit must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.window_secs == 0 {
            return Err(SlidegateError::Config(
                "window_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.key_by.is_empty() {
            return Err(SlidegateError::Config(
                "key_by must name at least one strategy".to_string(),
            ));
        }
        Ok(())
    }
}
