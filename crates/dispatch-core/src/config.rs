//! Configuration management for the dispatch system

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure, loaded once and passed explicitly to the
/// orchestrator. No hidden service-locator lookups mid-algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub provider: ProviderConfig,
    pub phone_lookup: PhoneLookupConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Bulk-messaging provider API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(alias = "url")]
    pub base_url: String,

    #[serde(alias = "token")]
    pub api_key: String,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// External CRM phone-lookup service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneLookupConfig {
    #[serde(alias = "url")]
    pub base_url: String,

    #[serde(alias = "token")]
    pub api_key: String,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default max items per lot when the campaign does not override it
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Default lot time window in seconds
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: i64,

    /// Max retry attempts before a failed item stops being eligible
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Max failed items examined per retry run
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Route cache TTL in seconds (default 4h)
    #[serde(default = "default_route_cache_ttl_secs")]
    pub route_cache_ttl_secs: i64,

    /// Processing lease duration; a lot claimed by one run is skipped by
    /// concurrent runs until the lease expires
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,

    /// Phone candidates shorter than this many digits are discarded
    #[serde(default = "default_min_phone_digits")]
    pub min_phone_digits: usize,

    /// Finished lots older than this many days are purged by the cleanup job
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            time_window_secs: default_time_window_secs(),
            max_retries: default_max_retries(),
            retry_limit: default_retry_limit(),
            route_cache_ttl_secs: default_route_cache_ttl_secs(),
            lease_secs: default_lease_secs(),
            min_phone_digits: default_min_phone_digits(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    5000
}

fn default_time_window_secs() -> i64 {
    1800
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_limit() -> u32 {
    1000
}

fn default_route_cache_ttl_secs() -> i64 {
    4 * 3600
}

fn default_lease_secs() -> i64 {
    600
}

fn default_min_phone_digits() -> usize {
    10
}

fn default_retention_days() -> i64 {
    90
}

fn default_db_path() -> String {
    "/data/dispatch/dispatch.db".to_string()
}

impl DispatchConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_json_str(&content)
    }

    /// Load configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.provider.base_url.is_empty() {
            return Err(DispatchError::Config(
                "Provider base URL is required".to_string(),
            ));
        }

        if self.provider.api_key.is_empty() {
            return Err(DispatchError::Config(
                "Provider API key is required".to_string(),
            ));
        }

        if self.phone_lookup.base_url.is_empty() {
            return Err(DispatchError::Config(
                "Phone lookup base URL is required".to_string(),
            ));
        }

        if self.orchestrator.batch_size == 0 {
            return Err(DispatchError::Config(
                "Batch size must be greater than zero".to_string(),
            ));
        }

        if self.orchestrator.time_window_secs <= 0 {
            return Err(DispatchError::Config(
                "Time window must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "provider": {
                "base_url": "https://bulk.example.com/api/v1",
                "api_key": "secret"
            },
            "phone_lookup": {
                "base_url": "https://lookup.example.com",
                "api_key": "lookup-secret"
            }
        }"#
        .to_string()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = DispatchConfig::from_json_str(&minimal_json()).unwrap();

        assert_eq!(config.orchestrator.batch_size, 5000);
        assert_eq!(config.orchestrator.time_window_secs, 1800);
        assert_eq!(config.orchestrator.route_cache_ttl_secs, 4 * 3600);
        assert_eq!(config.orchestrator.max_retries, 3);
        assert_eq!(config.provider.timeout_secs, 60);
    }

    #[test]
    fn missing_provider_key_is_rejected() {
        let json = r#"{
            "provider": {"base_url": "https://bulk.example.com", "api_key": ""},
            "phone_lookup": {"base_url": "https://lookup.example.com", "api_key": "x"}
        }"#;

        let err = DispatchConfig::from_json_str(json).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let json = r#"{
            "provider": {"base_url": "https://bulk.example.com", "api_key": "x"},
            "phone_lookup": {"base_url": "https://lookup.example.com", "api_key": "x"},
            "orchestrator": {"batch_size": 0}
        }"#;

        let err = DispatchConfig::from_json_str(json).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn url_aliases_are_accepted() {
        let json = r#"{
            "provider": {"url": "https://bulk.example.com", "token": "x"},
            "phone_lookup": {"url": "https://lookup.example.com", "token": "y"}
        }"#;

        let config = DispatchConfig::from_json_str(json).unwrap();
        assert_eq!(config.provider.base_url, "https://bulk.example.com");
        assert_eq!(config.phone_lookup.api_key, "y");
    }
}
