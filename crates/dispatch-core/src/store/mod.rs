//! Persistence abstraction for Lot and QueueItem aggregates
//!
//! A narrow repository interface: the orchestrator never touches SQL
//! directly, and tests substitute the store as a whole.

mod sqlite;

pub use sqlite::SqliteLotStore;

use crate::error::Result;
use crate::types::{
    CleanupReport, ContactId, CreateLotPayload, ItemPayload, ItemStatus, Lot, LotBinding,
    LotStatus, LotType, QueueItem, ServiceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fields for a lot about to be persisted
#[derive(Debug, Clone)]
pub struct NewLot {
    pub lot_type: LotType,
    pub service_type: Option<ServiceType>,
    pub campaign_id: String,
    pub event_id: Option<String>,
    pub id_quota_settings: Option<i64>,
    pub id_service_settings: i64,
    pub status: LotStatus,
    pub batch_size: u32,
    pub time_window_secs: i64,
    pub create_payload: CreateLotPayload,
}

/// Fields for a queue item about to be persisted
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub lot_id: i64,
    pub contact_id: ContactId,
    pub address_key: Option<String>,
    pub payload: ItemPayload,
    pub status: ItemStatus,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait LotStore: Send + Sync {
    async fn create_lot(&self, new_lot: NewLot) -> Result<Lot>;

    async fn get_lot(&self, id: i64) -> Result<Option<Lot>>;

    /// Most recent open lot matching the binding keys, if any
    async fn find_open_lot(&self, binding: &LotBinding) -> Result<Option<Lot>>;

    async fn list_lots_by_status(&self, status: LotStatus) -> Result<Vec<Lot>>;

    /// Status updates are forced to the store immediately so a failure state
    /// is durable even when the rest of the run goes sideways
    async fn set_lot_status(
        &self,
        id: i64,
        status: LotStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn set_external_lot_id(&self, id: i64, external_lot_id: String) -> Result<()>;

    /// Atomic counter bump; safe under concurrent enqueues
    async fn increment_messages_count(&self, id: i64) -> Result<()>;

    /// Claim a lot for processing. Returns false when another run holds an
    /// unexpired lease on it.
    async fn claim_lot(&self, id: i64, lease_secs: i64) -> Result<bool>;

    async fn release_lot(&self, id: i64) -> Result<()>;

    async fn insert_item(&self, new_item: NewQueueItem) -> Result<QueueItem>;

    /// Pending item for the dedup key, if one exists
    async fn find_pending_item(
        &self,
        lot_id: i64,
        contact_id: &ContactId,
        address_key: Option<&str>,
    ) -> Result<Option<QueueItem>>;

    /// Failed addressless row for the contact, if one exists. Keeps repeat
    /// enqueues of an undeliverable contact from piling up failed rows.
    async fn find_failed_placeholder(
        &self,
        lot_id: i64,
        contact_id: &ContactId,
    ) -> Result<Option<QueueItem>>;

    /// Pending items for a lot, FIFO by creation time
    async fn list_pending_items(&self, lot_id: i64) -> Result<Vec<QueueItem>>;

    async fn update_item_payload(
        &self,
        id: i64,
        payload: &ItemPayload,
        address_key: Option<&str>,
    ) -> Result<()>;

    async fn mark_items_sent(&self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<()>;

    /// Mark items failed; bumps retry_count when the failure consumed a
    /// dispatch attempt
    async fn mark_items_failed(&self, ids: &[i64], error: &str, bump_retry: bool) -> Result<()>;

    /// Fail all pending items of a lot (cancellation path)
    async fn mark_pending_items_failed(&self, lot_id: i64, error: &str) -> Result<usize>;

    /// Failed items still under the retry budget, oldest first
    async fn list_failed_items(&self, max_retries: i32, limit: u32) -> Result<Vec<QueueItem>>;

    async fn reset_items_to_pending(&self, ids: &[i64]) -> Result<usize>;

    /// Reset every failed item of a lot to pending (reprocess path)
    async fn reset_failed_items_for_lot(&self, lot_id: i64) -> Result<usize>;

    async fn count_items(&self, lot_id: i64) -> Result<i64>;

    /// Purge finished lots older than the cutoff; items go with them
    async fn delete_finished_lots_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport>;
}
