//! Common types used throughout the dispatch system
//! Lot and queue item aggregates are plain value structs; persistence goes
//! through the `LotStore` trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Strongly typed contact identifier from the host application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(String);

impl ContactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contact snapshot handed over by the host application at enqueue time.
/// `fields` carries the raw contact attributes (phone, email, collection
/// columns, tax id) the address resolver reads at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl Contact {
    /// String value of a contact field, if present and non-empty
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Lot classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotType {
    Message,
    Email,
}

impl LotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// Messaging channel for message lots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Sms,
    WhatsApp,
    Rcs,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "SMS",
            Self::WhatsApp => "WHATS_APP",
            Self::Rcs => "RCS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SMS" => Some(Self::Sms),
            "WHATS_APP" => Some(Self::WhatsApp),
            "RCS" => Some(Self::Rcs),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lot lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Creating,
    Open,
    Sending,
    Finished,
    Failed,
    FailedCreation,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Open => "open",
            Self::Sending => "sending",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::FailedCreation => "failed_creation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "open" => Some(Self::Open),
            "sending" => Some(Self::Sending),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "failed_creation" => Some(Self::FailedCreation),
            _ => None,
        }
    }
}

/// Queue item states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Sent,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Where deliverable addresses for a contact come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressSource {
    /// One address from a single contact field
    ContactField { field: String },
    /// The field holds an ordered JSON array; each entry is a candidate
    CollectionField { field: String },
    /// Addresses fetched from the external phone-lookup service, keyed by a
    /// contact attribute (tax id)
    ExternalLookup { tax_id_field: String },
}

/// Address-source configuration saved on the lot at enqueue time, so that
/// fan-out at dispatch time repeats exactly what enqueue time decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub source: AddressSource,
    /// Drop candidates that are not mobile numbers
    #[serde(default)]
    pub mobile_only: bool,
    /// Truncate the filtered, ordered candidate list to its first N entries
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Message body for message lots: fixed text or a provider template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSpec {
    Text { text: String },
    Template { template_id: String },
}

/// Envelope for email lots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSpec {
    pub from: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub cc: Vec<String>,
}

/// A resolved deliverable address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    Phone { area_code: String, number: String },
    Email { address: String },
}

impl Address {
    /// Normalized dedup key for the (lot, contact, address) invariant
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Phone { area_code, number } => format!("{}{}", area_code, number),
            Self::Email { address } => address.to_lowercase(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phone { area_code, number } => write!(f, "({}) {}", area_code, number),
            Self::Email { address } => f.write_str(address),
        }
    }
}

/// Everything needed to materialize the lot remotely, persisted at enqueue
/// time. Dates are deliberately absent: start/end are recomputed from the
/// time window at actual processing time. `extra` carries provider-specific
/// custom fields verbatim through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLotPayload {
    pub name: String,
    pub lot_type: LotType,
    pub service_type: Option<ServiceType>,
    pub id_quota_settings: Option<i64>,
    pub id_service_settings: i64,
    pub address: AddressConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailSpec>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Binding keys used for lot reuse-matching. A lot bound to different
/// quota/service settings or a different campaign event must never receive
/// cross-tenant items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotBinding {
    pub campaign_id: String,
    pub event_id: Option<String>,
    pub id_quota_settings: Option<i64>,
    pub id_service_settings: i64,
    pub service_type: Option<ServiceType>,
    pub lot_type: LotType,
}

/// A unit of remote-API work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: i64,
    pub external_lot_id: Option<String>,
    pub lot_type: LotType,
    pub service_type: Option<ServiceType>,
    pub campaign_id: String,
    pub event_id: Option<String>,
    pub id_quota_settings: Option<i64>,
    pub id_service_settings: i64,
    pub status: LotStatus,
    pub batch_size: u32,
    pub time_window_secs: i64,
    /// Authoritative running count of queue items, maintained via atomic
    /// increment at the store level
    pub messages_count: i64,
    pub error_message: Option<String>,
    pub create_payload: CreateLotPayload,
    pub created_at: DateTime<Utc>,
}

impl Lot {
    /// A lot closes once it is full or its time window has elapsed
    pub fn should_close(&self, now: DateTime<Utc>) -> bool {
        self.messages_count >= self.batch_size as i64
            || (now - self.created_at).num_seconds() >= self.time_window_secs
    }

    pub fn binding(&self) -> LotBinding {
        LotBinding {
            campaign_id: self.campaign_id.clone(),
            event_id: self.event_id.clone(),
            id_quota_settings: self.id_quota_settings,
            id_service_settings: self.id_service_settings,
            service_type: self.service_type,
            lot_type: self.lot_type,
        }
    }
}

/// Typed core of a queue item payload plus a sidecar opaque map for
/// provider-specific fields, preserved verbatim through the pipeline.
/// `fields` snapshots the contact attributes the fan-out step reads at
/// dispatch time. Mutable until the item reaches `Sent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub contact_name: String,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One deliverable unit (one phone number or one email address) tied to
/// exactly one contact and one lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub lot_id: i64,
    pub contact_id: ContactId,
    pub payload: ItemPayload,
    /// Normalized address key when the address is already known; `None` for
    /// placeholders resolved at dispatch time
    pub address_key: Option<String>,
    pub status: ItemStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Provider route, resolved via the routing lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id_service_settings: i64,
    pub id_quota_settings: Option<i64>,
    pub name: String,
    pub price: Option<f64>,
    pub available: bool,
    pub is_default: bool,
}

/// One phone-lookup candidate with its relevance score
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScoredNumber {
    pub number: String,
    pub score: f64,
}

/// Campaign-event context identifying the tenant/route a lot draws from
#[derive(Debug, Clone)]
pub struct EnqueueContext {
    pub campaign_id: String,
    pub event_id: Option<String>,
    pub service_settings_id: i64,
    pub booking_id: String,
    pub crm_id: String,
}

/// Per-campaign message configuration handed over by the host application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub lot_type: LotType,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    /// Lot name prefix; a unique suffix is appended per lot
    #[serde(default)]
    pub lot_name: Option<String>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub time_window_secs: Option<i64>,
    pub address: AddressConfig,
    #[serde(default)]
    pub message: Option<MessageSpec>,
    #[serde(default)]
    pub email: Option<EmailSpec>,
    #[serde(default)]
    pub custom_fields: HashMap<String, serde_json::Value>,
}

/// Outcome of a single contact enqueue
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Items persisted as pending (placeholders or known addresses)
    Enqueued(Vec<QueueItem>),
    /// Duplicate of a non-terminal item; no-op
    Skipped,
    /// No usable address at enqueue time; item persisted as failed so it is
    /// visible in lot statistics, contact-level operation still succeeds
    FailedAddress(QueueItem),
}

/// Counters returned by `process_due_lots`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub lots_examined: usize,
    pub lots_finished: usize,
    pub lots_failed: usize,
    pub lots_skipped_claimed: usize,
    pub items_sent: usize,
    pub items_failed: usize,
}

/// Counters returned by the retry operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub items_reset: usize,
    pub lots_touched: usize,
    pub items_skipped: usize,
}

/// Counters returned by `retry_failed_lot_creation`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CreationRetryReport {
    pub lots_examined: usize,
    pub lots_recovered: usize,
    pub lots_still_failed: usize,
}

/// Counters returned by the retention cleanup
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub lots_deleted: usize,
    pub items_deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_lot(batch_size: u32, window: i64, count: i64) -> Lot {
        Lot {
            id: 1,
            external_lot_id: None,
            lot_type: LotType::Message,
            service_type: Some(ServiceType::Sms),
            campaign_id: "camp-1".to_string(),
            event_id: None,
            id_quota_settings: Some(10),
            id_service_settings: 456,
            status: LotStatus::Open,
            batch_size,
            time_window_secs: window,
            messages_count: count,
            error_message: None,
            create_payload: CreateLotPayload {
                name: "lot".to_string(),
                lot_type: LotType::Message,
                service_type: Some(ServiceType::Sms),
                id_quota_settings: Some(10),
                id_service_settings: 456,
                address: AddressConfig {
                    source: AddressSource::ContactField {
                        field: "phone".to_string(),
                    },
                    mobile_only: false,
                    limit: None,
                },
                message: Some(MessageSpec::Text {
                    text: "hi".to_string(),
                }),
                email: None,
                extra: HashMap::new(),
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lot_closes_when_full() {
        let lot = sample_lot(100, 3600, 100);
        assert!(lot.should_close(Utc::now()));
    }

    #[test]
    fn lot_closes_when_window_elapsed() {
        let lot = sample_lot(100, 3600, 1);
        assert!(!lot.should_close(Utc::now()));
        assert!(lot.should_close(Utc::now() + Duration::seconds(3601)));
    }

    #[test]
    fn lot_stays_open_inside_window() {
        let lot = sample_lot(100, 3600, 99);
        assert!(!lot.should_close(Utc::now() + Duration::seconds(10)));
    }

    #[test]
    fn address_dedup_key_is_normalized() {
        let phone = Address::Phone {
            area_code: "11".to_string(),
            number: "987654321".to_string(),
        };
        assert_eq!(phone.dedup_key(), "11987654321");

        let email = Address::Email {
            address: "John.Doe@Example.COM".to_string(),
        };
        assert_eq!(email.dedup_key(), "john.doe@example.com");
    }

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            LotStatus::Creating,
            LotStatus::Open,
            LotStatus::Sending,
            LotStatus::Finished,
            LotStatus::Failed,
            LotStatus::FailedCreation,
        ] {
            assert_eq!(LotStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LotStatus::parse("bogus"), None);
    }

    #[test]
    fn create_payload_preserves_custom_fields_verbatim() {
        let json = r#"{
            "name": "campanha-x",
            "lot_type": "message",
            "service_type": "WHATS_APP",
            "id_quota_settings": 7,
            "id_service_settings": 456,
            "address": {"source": {"kind": "contact_field", "field": "phone"}},
            "message": {"kind": "text", "text": "oi"},
            "costCenter": "MKT-22",
            "priority": 3
        }"#;

        let payload: CreateLotPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.extra["costCenter"], "MKT-22");
        assert_eq!(payload.extra["priority"], 3);

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["costCenter"], "MKT-22");
        assert_eq!(back["priority"], 3);
    }
}
