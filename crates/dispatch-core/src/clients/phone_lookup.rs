//! External CRM phone-lookup client
//!
//! Returns scored phone candidates for a tax id. Ranking and deduplication
//! happen in the address resolver, not here.

use crate::config::PhoneLookupConfig;
use crate::error::{DispatchError, Result};
use crate::types::ScoredNumber;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;

#[async_trait]
pub trait PhoneLookup: Send + Sync {
    /// Look up phone candidates for a contact's tax id
    async fn lookup_phones(&self, tax_id: &str) -> Result<Vec<ScoredNumber>>;
}

pub struct PhoneLookupClient {
    config: PhoneLookupConfig,
    http_client: HttpClient,
}

impl PhoneLookupClient {
    pub fn new(config: PhoneLookupConfig) -> Self {
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            http_client,
        }
    }
}

#[async_trait]
impl PhoneLookup for PhoneLookupClient {
    async fn lookup_phones(&self, tax_id: &str) -> Result<Vec<ScoredNumber>> {
        let url = format!("{}/phones/{}", self.config.base_url, tax_id);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DispatchError::Provider(format!(
                "Phone lookup failed ({}): {}",
                status, body
            )));
        }

        let data: Value = response.json().await?;

        let mut numbers = Vec::new();
        if let Some(entries) = data["numbers"].as_array() {
            for entry in entries {
                let Some(number) = entry["number"].as_str() else {
                    continue;
                };
                numbers.push(ScoredNumber {
                    number: number.to_string(),
                    score: entry["score"].as_f64().unwrap_or(0.0),
                });
            }
        }

        log::debug!("Phone lookup returned {} candidates", numbers.len());

        Ok(numbers)
    }
}
