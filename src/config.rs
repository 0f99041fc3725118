//! Configuration for the envelope-encryption proxy

use crate::keys::{KeyMapping, KeyMappingError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Proxy configuration. Immutable once the engine is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Storage API endpoint requests are forwarded to
    #[serde(default = "default_upstream_endpoint")]
    pub upstream_endpoint: String,

    /// Hosts whose traffic is eligible for interception
    #[serde(default = "default_intercept_hosts")]
    pub intercept_hosts: Vec<String>,

    /// Bucket to key mapping: `bucket1:key1,bucket2:key2`.
    /// A `*:key` entry applies to every bucket and overrides specific entries.
    #[serde(default)]
    pub kms_bucket_key_mapping: String,

    /// Forward everything unmodified
    #[serde(default)]
    pub encryption_disabled: bool,

    /// Value of the `x-proxy-version` custom metadata on written objects
    #[serde(default = "default_proxy_version")]
    pub proxy_version: String,

    /// Idle lifetime of a cached cipher handle (humantime, e.g. "4h")
    #[serde(default = "default_cipher_cache_ttl")]
    pub cipher_cache_ttl: String,

    /// Lifetime of a resumable upload session record (humantime, e.g. "7d")
    #[serde(default = "default_session_ttl")]
    pub session_ttl: String,

    /// Maximum request/response body held in memory, in bytes
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Resumable session persistence
    #[serde(default)]
    pub session_store: SessionStoreConfig,

    /// Key management backend
    #[serde(default)]
    pub kms: KmsConfig,

    /// Log level filter string. Overridden by RUST_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where resumable upload sessions are kept between init and completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStoreConfig {
    /// Process-local map; sessions are lost on restart
    Memory,

    /// One JSON record per session under a directory
    Filesystem {
        /// Directory for session records
        path: PathBuf,
    },
}

/// Key management backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KmsConfig {
    /// Key-encryption keys derived locally from a 32-byte master secret
    Local {
        /// Hex-encoded 32-byte master key
        #[serde(default)]
        master_key: Option<String>,
    },
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9080))
}

fn default_upstream_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_intercept_hosts() -> Vec<String> {
    vec![
        "storage.googleapis.com".to_string(),
        "www.googleapis.com".to_string(),
    ]
}

fn default_proxy_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_cipher_cache_ttl() -> String {
    "4h".to_string()
}

fn default_session_ttl() -> String {
    "7d".to_string()
}

fn default_max_object_size() -> u64 {
    512 * 1024 * 1024 // 512MB
}

fn default_log_level() -> String {
    "gcs_envelope_proxy=info,tower_http=info".to_string()
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        SessionStoreConfig::Memory
    }
}

impl Default for KmsConfig {
    fn default() -> Self {
        KmsConfig::Local { master_key: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_endpoint: default_upstream_endpoint(),
            intercept_hosts: default_intercept_hosts(),
            kms_bucket_key_mapping: String::new(),
            encryption_disabled: false,
            proxy_version: default_proxy_version(),
            cipher_cache_ttl: default_cipher_cache_ttl(),
            session_ttl: default_session_ttl(),
            max_object_size: default_max_object_size(),
            session_store: SessionStoreConfig::default(),
            kms: KmsConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GCSP_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(endpoint) = std::env::var("GCSP_UPSTREAM_ENDPOINT") {
            config.upstream_endpoint = endpoint;
        }

        if let Ok(hosts) = std::env::var("GCSP_INTERCEPT_HOSTS") {
            config.intercept_hosts = hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }

        if let Ok(mapping) = std::env::var("GCSP_KMS_BUCKET_KEY_MAPPING") {
            config.kms_bucket_key_mapping = mapping;
        }

        config.encryption_disabled = std::env::var("GCSP_DISABLE_ENCRYPTION")
            .map(|v| !v.is_empty() && v != "0" && v != "false")
            .unwrap_or(false);

        if let Ok(ttl) = std::env::var("GCSP_CIPHER_CACHE_TTL") {
            config.cipher_cache_ttl = ttl;
        }

        if let Ok(ttl) = std::env::var("GCSP_SESSION_TTL") {
            config.session_ttl = ttl;
        }

        if let Ok(size) = std::env::var("GCSP_MAX_OBJECT_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.max_object_size = parsed;
            }
        }

        if let Ok(dir) = std::env::var("GCSP_SESSION_DIR") {
            config.session_store = SessionStoreConfig::Filesystem {
                path: PathBuf::from(dir),
            };
        }

        config.kms = KmsConfig::Local {
            master_key: std::env::var("GCSP_LOCAL_MASTER_KEY").ok(),
        };

        if let Ok(level) = std::env::var("GCSP_LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("GCSP_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &[
            "gcs_envelope_proxy.toml",
            "/etc/gcs_envelope_proxy/config.toml",
        ] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    /// Parsed bucket to key mapping
    pub fn key_mapping(&self) -> Result<KeyMapping, ConfigError> {
        KeyMapping::parse(&self.kms_bucket_key_mapping).map_err(ConfigError::from)
    }

    pub fn cipher_cache_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration("cipher_cache_ttl", &self.cipher_cache_ttl)
    }

    pub fn session_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration("session_ttl", &self.session_ttl)
    }

    /// Check every derived value once at startup so the engine never sees a
    /// half-valid configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.key_mapping()?;
        self.cipher_cache_ttl()?;
        self.session_ttl()?;
        if self.intercept_hosts.is_empty() {
            return Err(ConfigError::Invalid(
                "intercept_hosts must name at least one host".to_string(),
            ));
        }
        if !self.encryption_disabled {
            match &self.kms {
                KmsConfig::Local { master_key: None } => {
                    return Err(ConfigError::Invalid(
                        "kms.master_key (or GCSP_LOCAL_MASTER_KEY) is required".to_string(),
                    ));
                }
                KmsConfig::Local { master_key: Some(_) } => {}
            }
        }
        Ok(())
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Duration {
        field,
        reason: e.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid {field}: {reason}")]
    Duration { field: &'static str, reason: String },

    #[error("Invalid key mapping: {0}")]
    KeyMapping(#[from] KeyMappingError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
