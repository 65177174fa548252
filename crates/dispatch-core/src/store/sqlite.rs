//! SQLite-backed lot store
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread; do not open additional connections for writes.

use super::{LotStore, NewLot, NewQueueItem};
use crate::error::{DispatchError, Result};
use crate::types::{
    CleanupReport, ContactId, ItemPayload, ItemStatus, Lot, LotBinding, LotStatus, LotType,
    QueueItem, ServiceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

const LOT_COLUMNS: &str = "id, external_lot_id, lot_type, service_type, campaign_id, event_id, \
     id_quota_settings, id_service_settings, status, batch_size, time_window_secs, \
     messages_count, error_message, create_payload, created_at";

const ITEM_COLUMNS: &str =
    "id, lot_id, contact_id, address_key, payload, status, retry_count, error_message, \
     created_at, sent_at";

pub struct SqliteLotStore {
    conn: Connection,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC format; lexicographic order equals chronological order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn json_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn bad_enum(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(
        0,
        format!("unexpected {} value: {}", column, value),
        rusqlite::types::Type::Text,
    )
}

fn lot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lot> {
    let lot_type_raw: String = row.get(2)?;
    let service_type_raw: Option<String> = row.get(3)?;
    let status_raw: String = row.get(8)?;
    let payload_raw: String = row.get(13)?;
    let created_raw: String = row.get(14)?;

    let service_type = match service_type_raw {
        Some(raw) => Some(ServiceType::parse(&raw).ok_or_else(|| bad_enum("service_type", &raw))?),
        None => None,
    };

    Ok(Lot {
        id: row.get(0)?,
        external_lot_id: row.get(1)?,
        lot_type: LotType::parse(&lot_type_raw).ok_or_else(|| bad_enum("lot_type", &lot_type_raw))?,
        service_type,
        campaign_id: row.get(4)?,
        event_id: row.get(5)?,
        id_quota_settings: row.get(6)?,
        id_service_settings: row.get(7)?,
        status: LotStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        batch_size: row.get(9)?,
        time_window_secs: row.get(10)?,
        messages_count: row.get(11)?,
        error_message: row.get(12)?,
        create_payload: serde_json::from_str(&payload_raw).map_err(|e| json_error(13, e))?,
        created_at: parse_ts(&created_raw)?,
    })
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let contact_id: String = row.get(2)?;
    let payload_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let created_raw: String = row.get(8)?;
    let sent_raw: Option<String> = row.get(9)?;

    let sent_at = match sent_raw {
        Some(raw) => Some(parse_ts(&raw)?),
        None => None,
    };

    Ok(QueueItem {
        id: row.get(0)?,
        lot_id: row.get(1)?,
        contact_id: ContactId::new(contact_id),
        address_key: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).map_err(|e| json_error(4, e))?,
        status: ItemStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        retry_count: row.get(6)?,
        error_message: row.get(7)?,
        created_at: parse_ts(&created_raw)?,
        sent_at,
    })
}

impl SqliteLotStore {
    /// Open (and migrate) the store at the given path
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).await?;
        Self::initialize(&conn).await?;
        Ok(Self { conn })
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::initialize(&conn).await?;
        Ok(Self { conn })
    }

    async fn initialize(conn: &Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;

                 CREATE TABLE IF NOT EXISTS lots (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     external_lot_id TEXT,
                     lot_type TEXT NOT NULL,
                     service_type TEXT,
                     campaign_id TEXT NOT NULL,
                     event_id TEXT,
                     id_quota_settings INTEGER,
                     id_service_settings INTEGER NOT NULL,
                     status TEXT NOT NULL,
                     batch_size INTEGER NOT NULL,
                     time_window_secs INTEGER NOT NULL,
                     messages_count INTEGER NOT NULL DEFAULT 0,
                     error_message TEXT,
                     create_payload TEXT NOT NULL,
                     processing_until TEXT,
                     created_at TEXT NOT NULL
                 );

                 CREATE INDEX IF NOT EXISTS idx_lots_status_created
                     ON lots (status, created_at);

                 CREATE TABLE IF NOT EXISTS queue_items (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     lot_id INTEGER NOT NULL REFERENCES lots (id) ON DELETE CASCADE,
                     contact_id TEXT NOT NULL,
                     address_key TEXT,
                     payload TEXT NOT NULL,
                     status TEXT NOT NULL,
                     retry_count INTEGER NOT NULL DEFAULT 0,
                     error_message TEXT,
                     created_at TEXT NOT NULL,
                     sent_at TEXT
                 );

                 CREATE INDEX IF NOT EXISTS idx_items_lot_status
                     ON queue_items (lot_id, status);",
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LotStore for SqliteLotStore {
    async fn create_lot(&self, new_lot: NewLot) -> Result<Lot> {
        let payload_json = serde_json::to_string(&new_lot.create_payload)?;
        let created_at = fmt_ts(Utc::now());

        let lot = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO lots (external_lot_id, lot_type, service_type, campaign_id, \
                     event_id, id_quota_settings, id_service_settings, status, batch_size, \
                     time_window_secs, messages_count, error_message, create_payload, created_at) \
                     VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10, ?11)",
                    params![
                        new_lot.lot_type.as_str(),
                        new_lot.service_type.map(|s| s.as_str()),
                        new_lot.campaign_id,
                        new_lot.event_id,
                        new_lot.id_quota_settings,
                        new_lot.id_service_settings,
                        new_lot.status.as_str(),
                        new_lot.batch_size,
                        new_lot.time_window_secs,
                        payload_json,
                        created_at,
                    ],
                )?;

                let id = conn.last_insert_rowid();
                let lot = conn.query_row(
                    &format!("SELECT {} FROM lots WHERE id = ?1", LOT_COLUMNS),
                    params![id],
                    lot_from_row,
                )?;
                Ok(lot)
            })
            .await?;

        Ok(lot)
    }

    async fn get_lot(&self, id: i64) -> Result<Option<Lot>> {
        let lot = self
            .conn
            .call(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {} FROM lots WHERE id = ?1", LOT_COLUMNS),
                    params![id],
                    lot_from_row,
                );
                match result {
                    Ok(lot) => Ok(Some(lot)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        Ok(lot)
    }

    async fn find_open_lot(&self, binding: &LotBinding) -> Result<Option<Lot>> {
        let binding = binding.clone();

        let lot = self
            .conn
            .call(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {} FROM lots \
                         WHERE status = 'open' \
                           AND lot_type = ?1 \
                           AND campaign_id = ?2 \
                           AND event_id IS ?3 \
                           AND id_quota_settings IS ?4 \
                           AND id_service_settings = ?5 \
                           AND service_type IS ?6 \
                         ORDER BY created_at DESC, id DESC \
                         LIMIT 1",
                        LOT_COLUMNS
                    ),
                    params![
                        binding.lot_type.as_str(),
                        binding.campaign_id,
                        binding.event_id,
                        binding.id_quota_settings,
                        binding.id_service_settings,
                        binding.service_type.map(|s| s.as_str()),
                    ],
                    lot_from_row,
                );
                match result {
                    Ok(lot) => Ok(Some(lot)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        Ok(lot)
    }

    async fn list_lots_by_status(&self, status: LotStatus) -> Result<Vec<Lot>> {
        let lots = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM lots WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                    LOT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str()], lot_from_row)?;
                let mut lots = Vec::new();
                for lot in rows {
                    lots.push(lot?);
                }
                Ok(lots)
            })
            .await?;

        Ok(lots)
    }

    async fn set_lot_status(
        &self,
        id: i64,
        status: LotStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let updated = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE lots SET status = ?1, error_message = ?2 WHERE id = ?3",
                    params![status.as_str(), error_message, id],
                )?;
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(DispatchError::NotFound(format!("Lot {} not found", id)));
        }
        Ok(())
    }

    async fn set_external_lot_id(&self, id: i64, external_lot_id: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE lots SET external_lot_id = ?1 WHERE id = ?2",
                    params![external_lot_id, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn increment_messages_count(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE lots SET messages_count = messages_count + 1 WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn claim_lot(&self, id: i64, lease_secs: i64) -> Result<bool> {
        let now = Utc::now();
        let now_s = fmt_ts(now);
        let until_s = fmt_ts(now + Duration::seconds(lease_secs));

        let claimed = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE lots SET processing_until = ?1 \
                     WHERE id = ?2 AND (processing_until IS NULL OR processing_until < ?3)",
                    params![until_s, id, now_s],
                )?;
                Ok(updated == 1)
            })
            .await?;

        Ok(claimed)
    }

    async fn release_lot(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE lots SET processing_until = NULL WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn insert_item(&self, new_item: NewQueueItem) -> Result<QueueItem> {
        let payload_json = serde_json::to_string(&new_item.payload)?;
        let created_at = fmt_ts(Utc::now());

        let item = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue_items (lot_id, contact_id, address_key, payload, status, \
                     retry_count, error_message, created_at, sent_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, NULL)",
                    params![
                        new_item.lot_id,
                        new_item.contact_id.as_str(),
                        new_item.address_key,
                        payload_json,
                        new_item.status.as_str(),
                        new_item.error_message,
                        created_at,
                    ],
                )?;

                let id = conn.last_insert_rowid();
                let item = conn.query_row(
                    &format!("SELECT {} FROM queue_items WHERE id = ?1", ITEM_COLUMNS),
                    params![id],
                    item_from_row,
                )?;
                Ok(item)
            })
            .await?;

        Ok(item)
    }

    async fn find_pending_item(
        &self,
        lot_id: i64,
        contact_id: &ContactId,
        address_key: Option<&str>,
    ) -> Result<Option<QueueItem>> {
        let contact_id = contact_id.as_str().to_string();
        let address_key = address_key.map(|s| s.to_string());

        let item = self
            .conn
            .call(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {} FROM queue_items \
                         WHERE lot_id = ?1 AND contact_id = ?2 AND address_key IS ?3 \
                           AND status = 'pending' \
                         LIMIT 1",
                        ITEM_COLUMNS
                    ),
                    params![lot_id, contact_id, address_key],
                    item_from_row,
                );
                match result {
                    Ok(item) => Ok(Some(item)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        Ok(item)
    }

    async fn find_failed_placeholder(
        &self,
        lot_id: i64,
        contact_id: &ContactId,
    ) -> Result<Option<QueueItem>> {
        let contact_id = contact_id.as_str().to_string();

        let item = self
            .conn
            .call(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {} FROM queue_items \
                         WHERE lot_id = ?1 AND contact_id = ?2 AND address_key IS NULL \
                           AND status = 'failed' \
                         LIMIT 1",
                        ITEM_COLUMNS
                    ),
                    params![lot_id, contact_id],
                    item_from_row,
                );
                match result {
                    Ok(item) => Ok(Some(item)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        Ok(item)
    }

    async fn list_pending_items(&self, lot_id: i64) -> Result<Vec<QueueItem>> {
        let items = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_items \
                     WHERE lot_id = ?1 AND status = 'pending' \
                     ORDER BY created_at ASC, id ASC",
                    ITEM_COLUMNS
                ))?;
                let rows = stmt.query_map(params![lot_id], item_from_row)?;
                let mut items = Vec::new();
                for item in rows {
                    items.push(item?);
                }
                Ok(items)
            })
            .await?;

        Ok(items)
    }

    async fn update_item_payload(
        &self,
        id: i64,
        payload: &ItemPayload,
        address_key: Option<&str>,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        let address_key = address_key.map(|s| s.to_string());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE queue_items SET payload = ?1, address_key = ?2 \
                     WHERE id = ?3 AND status != 'sent'",
                    params![payload_json, address_key, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn mark_items_sent(&self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<()> {
        let ids = ids.to_vec();
        let sent_s = fmt_ts(sent_at);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE queue_items SET status = 'sent', sent_at = ?1, \
                         error_message = NULL WHERE id = ?2",
                    )?;
                    for id in &ids {
                        stmt.execute(params![sent_s, id])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn mark_items_failed(&self, ids: &[i64], error: &str, bump_retry: bool) -> Result<()> {
        let ids = ids.to_vec();
        let error = error.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let sql = if bump_retry {
                        "UPDATE queue_items SET status = 'failed', error_message = ?1, \
                         retry_count = retry_count + 1 WHERE id = ?2"
                    } else {
                        "UPDATE queue_items SET status = 'failed', error_message = ?1 \
                         WHERE id = ?2"
                    };
                    let mut stmt = tx.prepare(sql)?;
                    for id in &ids {
                        stmt.execute(params![error, id])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn mark_pending_items_failed(&self, lot_id: i64, error: &str) -> Result<usize> {
        let error = error.to_string();

        let updated = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE queue_items SET status = 'failed', error_message = ?1 \
                     WHERE lot_id = ?2 AND status = 'pending'",
                    params![error, lot_id],
                )?;
                Ok(updated)
            })
            .await?;

        Ok(updated)
    }

    async fn list_failed_items(&self, max_retries: i32, limit: u32) -> Result<Vec<QueueItem>> {
        let items = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_items \
                     WHERE status = 'failed' AND retry_count < ?1 \
                     ORDER BY created_at ASC, id ASC \
                     LIMIT ?2",
                    ITEM_COLUMNS
                ))?;
                let rows = stmt.query_map(params![max_retries, limit], item_from_row)?;
                let mut items = Vec::new();
                for item in rows {
                    items.push(item?);
                }
                Ok(items)
            })
            .await?;

        Ok(items)
    }

    async fn reset_items_to_pending(&self, ids: &[i64]) -> Result<usize> {
        let ids = ids.to_vec();

        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE queue_items SET status = 'pending', error_message = NULL \
                         WHERE id = ?1 AND status = 'failed'",
                    )?;
                    for id in &ids {
                        updated += stmt.execute(params![id])?;
                    }
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?;

        Ok(updated)
    }

    async fn reset_failed_items_for_lot(&self, lot_id: i64) -> Result<usize> {
        let updated = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE queue_items SET status = 'pending', error_message = NULL \
                     WHERE lot_id = ?1 AND status = 'failed'",
                    params![lot_id],
                )?;
                Ok(updated)
            })
            .await?;

        Ok(updated)
    }

    async fn count_items(&self, lot_id: i64) -> Result<i64> {
        let count = self
            .conn
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM queue_items WHERE lot_id = ?1",
                    params![lot_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;

        Ok(count)
    }

    async fn delete_finished_lots_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff_s = fmt_ts(cutoff);

        let report = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let items_deleted = tx.execute(
                    "DELETE FROM queue_items WHERE lot_id IN \
                     (SELECT id FROM lots WHERE status = 'finished' AND created_at < ?1)",
                    params![cutoff_s],
                )?;
                let lots_deleted = tx.execute(
                    "DELETE FROM lots WHERE status = 'finished' AND created_at < ?1",
                    params![cutoff_s],
                )?;
                tx.commit()?;
                Ok(CleanupReport {
                    lots_deleted,
                    items_deleted,
                })
            })
            .await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressConfig, AddressSource, CreateLotPayload, MessageSpec};
    use std::collections::HashMap;

    fn new_lot(campaign: &str) -> NewLot {
        NewLot {
            lot_type: LotType::Message,
            service_type: Some(ServiceType::Sms),
            campaign_id: campaign.to_string(),
            event_id: None,
            id_quota_settings: Some(10),
            id_service_settings: 456,
            status: LotStatus::Open,
            batch_size: 100,
            time_window_secs: 1800,
            create_payload: CreateLotPayload {
                name: format!("{}-lot", campaign),
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
                    text: "hello".to_string(),
                }),
                email: None,
                extra: HashMap::new(),
            },
        }
    }

    fn new_item(lot_id: i64, contact: &str, key: Option<&str>) -> NewQueueItem {
        NewQueueItem {
            lot_id,
            contact_id: ContactId::new(contact),
            address_key: key.map(|s| s.to_string()),
            payload: ItemPayload {
                address: None,
                contact_name: contact.to_string(),
                fields: HashMap::new(),
                extra: HashMap::new(),
            },
            status: ItemStatus::Pending,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn create_and_reload_lot() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();

        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();
        assert_eq!(lot.status, LotStatus::Open);
        assert_eq!(lot.messages_count, 0);

        let reloaded = store.get_lot(lot.id).await.unwrap().unwrap();
        assert_eq!(reloaded.campaign_id, "camp-1");
        assert_eq!(reloaded.create_payload.name, "camp-1-lot");
    }

    #[tokio::test]
    async fn find_open_lot_requires_exact_binding() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        let found = store.find_open_lot(&lot.binding()).await.unwrap();
        assert_eq!(found.unwrap().id, lot.id);

        // A different quota binding must never match
        let mut other = lot.binding();
        other.id_quota_settings = Some(99);
        assert!(store.find_open_lot(&other).await.unwrap().is_none());

        // Closed lots are not reuse candidates
        store
            .set_lot_status(lot.id, LotStatus::Finished, None)
            .await
            .unwrap();
        assert!(store.find_open_lot(&lot.binding()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counter_increment_is_cumulative() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        for _ in 0..5 {
            store.increment_messages_count(lot.id).await.unwrap();
        }

        let reloaded = store.get_lot(lot.id).await.unwrap().unwrap();
        assert_eq!(reloaded.messages_count, 5);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        assert!(store.claim_lot(lot.id, 600).await.unwrap());
        // Second claim while the lease is held must fail
        assert!(!store.claim_lot(lot.id, 600).await.unwrap());

        store.release_lot(lot.id).await.unwrap();
        assert!(store.claim_lot(lot.id, 600).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        // Zero-length lease expires immediately
        assert!(store.claim_lot(lot.id, 0).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store.claim_lot(lot.id, 600).await.unwrap());
    }

    #[tokio::test]
    async fn pending_items_are_fifo() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        for contact in ["c1", "c2", "c3"] {
            store.insert_item(new_item(lot.id, contact, None)).await.unwrap();
        }

        let pending = store.list_pending_items(lot.id).await.unwrap();
        let order: Vec<&str> = pending.iter().map(|i| i.contact_id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn find_pending_item_distinguishes_address_keys() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        store
            .insert_item(new_item(lot.id, "c1", Some("11987654321")))
            .await
            .unwrap();

        let hit = store
            .find_pending_item(lot.id, &ContactId::new("c1"), Some("11987654321"))
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = store
            .find_pending_item(lot.id, &ContactId::new("c1"), Some("11911111111"))
            .await
            .unwrap();
        assert!(miss.is_none());

        // Placeholder (NULL key) is a distinct slot
        let placeholder = store
            .find_pending_item(lot.id, &ContactId::new("c1"), None)
            .await
            .unwrap();
        assert!(placeholder.is_none());
    }

    #[tokio::test]
    async fn failed_placeholder_is_found_per_contact() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        let mut item = new_item(lot.id, "c1", None);
        item.status = ItemStatus::Failed;
        item.error_message = Some("no usable address".to_string());
        store.insert_item(item).await.unwrap();

        // Keyed rows never count as placeholders
        let mut keyed = new_item(lot.id, "c2", Some("11987654321"));
        keyed.status = ItemStatus::Failed;
        store.insert_item(keyed).await.unwrap();

        assert!(store
            .find_failed_placeholder(lot.id, &ContactId::new("c1"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_failed_placeholder(lot.id, &ContactId::new("c2"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_failed_placeholder(lot.id, &ContactId::new("c3"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sent_items_leave_the_pending_set() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();
        let item = store.insert_item(new_item(lot.id, "c1", None)).await.unwrap();

        store.mark_items_sent(&[item.id], Utc::now()).await.unwrap();

        assert!(store.list_pending_items(lot.id).await.unwrap().is_empty());
        let hit = store
            .find_pending_item(lot.id, &ContactId::new("c1"), None)
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn failed_items_respect_retry_budget() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        let a = store.insert_item(new_item(lot.id, "c1", None)).await.unwrap();
        let b = store.insert_item(new_item(lot.id, "c2", None)).await.unwrap();

        // a fails three times, b once
        for _ in 0..3 {
            store.mark_items_failed(&[a.id], "boom", true).await.unwrap();
        }
        store.mark_items_failed(&[b.id], "boom", true).await.unwrap();

        let eligible = store.list_failed_items(3, 100).await.unwrap();
        let ids: Vec<i64> = eligible.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn reset_to_pending_clears_error_but_keeps_retry_count() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();
        let item = store.insert_item(new_item(lot.id, "c1", None)).await.unwrap();

        store.mark_items_failed(&[item.id], "boom", true).await.unwrap();
        let reset = store.reset_items_to_pending(&[item.id]).await.unwrap();
        assert_eq!(reset, 1);

        let pending = store.list_pending_items(lot.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].error_message.is_none());
    }

    #[tokio::test]
    async fn cleanup_cascades_to_items() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();
        store.insert_item(new_item(lot.id, "c1", None)).await.unwrap();
        store.insert_item(new_item(lot.id, "c2", None)).await.unwrap();
        store
            .set_lot_status(lot.id, LotStatus::Finished, None)
            .await
            .unwrap();

        // Cutoff in the future: everything finished qualifies
        let report = store
            .delete_finished_lots_before(Utc::now() + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.lots_deleted, 1);
        assert_eq!(report.items_deleted, 2);
        assert!(store.get_lot(lot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_spares_open_lots() {
        let store = SqliteLotStore::open_in_memory().await.unwrap();
        let lot = store.create_lot(new_lot("camp-1")).await.unwrap();

        let report = store
            .delete_finished_lots_before(Utc::now() + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.lots_deleted, 0);
        assert!(store.get_lot(lot.id).await.unwrap().is_some());
    }
}
