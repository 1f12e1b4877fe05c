//! # Configuration Module
//!
//! Service configuration loaded from YAML, with environment variable overrides and
//! validation that reports every problem at once.
//!
//! Every section is fully defaulted, so an empty file (or no file at all) yields a
//! working in-memory setup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::caching::{CachePolicy, StoreBackend, StoreConfig};
use crate::core::error::{ServiceError, ServiceResult};
use crate::observability::LogConfig;

/// Top-level service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,

    /// Backend and write-back settings
    pub store: StoreConfig,

    /// Policy applied to cached routes
    pub cache: CachePolicy,

    pub logging: LogConfig,

    /// Address for the Prometheus scrape endpoint; metrics are not exported when unset
    pub metrics_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file, then apply environment overrides and
    /// validate.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            ServiceError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults. Overrides and
    /// validation apply either way.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        if tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false) {
            return Self::load_from_file(path).await;
        }

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> ServiceResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `RESPONSE_CACHE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> ServiceResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> ServiceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("RESPONSE_CACHE_BIND_ADDRESS") {
            self.server.bind_address = address;
        }

        if let Some(backend) = lookup("RESPONSE_CACHE_STORE_BACKEND") {
            self.store.backend = backend.parse::<StoreBackend>().map_err(|e| {
                ServiceError::config(format!("Invalid RESPONSE_CACHE_STORE_BACKEND: {}", e))
            })?;
        }

        if let Some(url) = lookup("RESPONSE_CACHE_REDIS_URL") {
            self.store.redis.url = url;
        }

        if let Some(ttl) = lookup("RESPONSE_CACHE_TTL") {
            self.cache.ttl = Some(humantime::parse_duration(&ttl).map_err(|e| {
                ServiceError::config(format!("Invalid RESPONSE_CACHE_TTL: {}", e))
            })?);
        }

        if let Some(level) = lookup("RESPONSE_CACHE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(asynchronous) = lookup("RESPONSE_CACHE_WRITE_BACK_ASYNC") {
            self.store.write_back.asynchronous = asynchronous.parse().map_err(|e| {
                ServiceError::config(format!("Invalid RESPONSE_CACHE_WRITE_BACK_ASYNC: {}", e))
            })?;
        }

        Ok(())
    }

    /// Validate the configuration, collecting all errors
    pub fn validate(&self) -> ServiceResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_address '{}' is not a socket address",
                self.server.bind_address
            ));
        }

        if let Err(e) = self.store.write_back.validate() {
            errors.push(e.to_string());
        }

        if self.store.backend == StoreBackend::Redis && !self.store.redis.is_cluster() {
            if let Err(e) = url::Url::parse(&self.store.redis.url) {
                errors.push(format!(
                    "store.redis.url '{}' is invalid: {}",
                    self.store.redis.url, e
                ));
            }
        }

        if matches!(self.cache.ttl, Some(ttl) if ttl.is_zero()) {
            errors.push("cache.ttl must be greater than 0 when set".to_string());
        }

        if let Some(address) = &self.metrics_address {
            if address.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!("metrics_address '{}' is not a socket address", address));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}
