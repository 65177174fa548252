//! Bulk-messaging provider client
//!
//! Thin synchronous wrapper over the provider's four operations. API-level
//! failures come back as `DispatchError::Provider` results, never panics.

use crate::config::ProviderConfig;
use crate::error::{DispatchError, Result};
use crate::types::{Route, ServiceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Provider hard limit: items accepted per add-items call
pub const MAX_ITEMS_PER_CALL: usize = 5000;

/// Remote lot creation request. Start/end timestamps are computed at actual
/// processing time, not enqueue time.
#[derive(Debug, Clone)]
pub struct RemoteLotRequest {
    pub name: String,
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub id_quota_settings: Option<i64>,
    pub id_service_settings: i64,
    pub service_type: Option<ServiceType>,
    pub custom_fields: HashMap<String, Value>,
}

/// One deliverable item on the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundItem {
    #[serde(rename_all = "camelCase")]
    Phone {
        service_type: ServiceType,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        template_id: Option<String>,
        area_code: String,
        phone: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        variables: HashMap<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Email {
        from: String,
        to: String,
        subject: String,
        body: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        cc: Vec<String>,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        variables: HashMap<String, Value>,
    },
}

/// The four provider operations the orchestration core depends on
#[async_trait]
pub trait BulkMessagingApi: Send + Sync {
    /// Create a remote lot, returning its external id
    async fn create_lot(&self, request: &RemoteLotRequest) -> Result<String>;

    /// Add up to `MAX_ITEMS_PER_CALL` items to an open remote lot
    async fn add_items(&self, external_lot_id: &str, items: &[OutboundItem]) -> Result<()>;

    /// Close the remote lot; it accepts no more items afterwards
    async fn finish_lot(&self, external_lot_id: &str) -> Result<()>;

    /// List routes for (booking, crm, service type); used to resolve quota
    /// settings
    async fn get_routes(
        &self,
        booking_id: &str,
        crm_id: &str,
        service_type: ServiceType,
    ) -> Result<Vec<Route>>;
}

pub struct BulkMessagingClient {
    config: ProviderConfig,
    http_client: HttpClient,
}

impl BulkMessagingClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            http_client,
        }
    }

    async fn provider_error(context: &str, response: reqwest::Response) -> DispatchError {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        DispatchError::Provider(format!("{} ({}): {}", context, status, body))
    }
}

#[async_trait]
impl BulkMessagingApi for BulkMessagingClient {
    async fn create_lot(&self, request: &RemoteLotRequest) -> Result<String> {
        let url = format!("{}/lots", self.config.base_url);

        let mut body = json!({
            "name": request.name,
            "dateStart": request.date_start.to_rfc3339(),
            "dateEnd": request.date_end.to_rfc3339(),
            "idServiceSettings": request.id_service_settings,
        });
        if let Some(quota) = request.id_quota_settings {
            body["idQuotaSettings"] = json!(quota);
        }
        if let Some(service_type) = request.service_type {
            body["serviceType"] = json!(service_type.as_str());
        }
        if !request.custom_fields.is_empty() {
            body["customFields"] = json!(request.custom_fields);
        }

        log::debug!("Creating remote lot '{}'", request.name);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error("Lot creation failed", response).await);
        }

        let result: Value = response.json().await?;

        // Providers have shipped the id under different keys across versions
        result["id"]
            .as_str()
            .or_else(|| result["lotId"].as_str())
            .or_else(|| result["externalLotId"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                DispatchError::Provider(format!("Lot creation response missing id: {}", result))
            })
    }

    async fn add_items(&self, external_lot_id: &str, items: &[OutboundItem]) -> Result<()> {
        if items.len() > MAX_ITEMS_PER_CALL {
            return Err(DispatchError::Invariant(format!(
                "Attempted to send {} items in one call (provider limit {})",
                items.len(),
                MAX_ITEMS_PER_CALL
            )));
        }

        let url = format!("{}/lots/{}/messages", self.config.base_url, external_lot_id);

        log::debug!(
            "Adding {} items to remote lot {}",
            items.len(),
            external_lot_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "items": items }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error("Add items failed", response).await);
        }

        Ok(())
    }

    async fn finish_lot(&self, external_lot_id: &str) -> Result<()> {
        let url = format!("{}/lots/{}/finish", self.config.base_url, external_lot_id);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error("Finish lot failed", response).await);
        }

        Ok(())
    }

    async fn get_routes(
        &self,
        booking_id: &str,
        crm_id: &str,
        service_type: ServiceType,
    ) -> Result<Vec<Route>> {
        let url = format!("{}/routes", self.config.base_url);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .query(&[
                ("bookingId", booking_id),
                ("crmId", crm_id),
                ("serviceType", service_type.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error("Route listing failed", response).await);
        }

        let data: Value = response.json().await?;

        let raw_routes = data["routes"]
            .as_array()
            .or_else(|| data.as_array())
            .cloned()
            .unwrap_or_default();

        let mut routes = Vec::new();
        for raw in raw_routes {
            routes.push(Route {
                id_service_settings: raw["idServiceSettings"].as_i64().unwrap_or_default(),
                id_quota_settings: raw["idQuotaSettings"].as_i64(),
                name: raw["name"].as_str().unwrap_or("").to_string(),
                price: raw["price"].as_f64(),
                available: raw["available"].as_bool().unwrap_or(false),
                is_default: raw["isDefault"].as_bool().unwrap_or(false),
            });
        }

        Ok(routes)
    }
}

/// Best-effort user-facing translation for a small set of known provider
/// error substrings. The raw provider text is always preserved alongside.
pub fn user_facing_provider_error(raw: &str) -> String {
    let lower = raw.to_lowercase();

    let translated = if lower.contains("quota settings must not be zero") {
        Some(
            "Configuração de cota inválida para a rota selecionada. Verifique as \
             configurações de cota do serviço antes de reprocessar o lote.",
        )
    } else if lower.contains("lot is already finished") || lower.contains("lot already finished") {
        Some("O lote remoto já foi finalizado e não aceita novos itens.")
    } else if lower.contains("invalid phone") {
        Some("Um ou mais números de telefone do lote foram rejeitados pelo provedor.")
    } else if lower.contains("unauthorized") || lower.contains("invalid token") {
        Some("Credenciais do provedor inválidas ou expiradas. Verifique a chave de API.")
    } else {
        None
    };

    match translated {
        Some(message) => format!("{} [{}]", message, raw),
        None => raw.to_string(),
    }
}
