//! Retry, cancellation and retention operations

use super::LotOrchestrator;
use crate::error::{DispatchError, Result};
use crate::types::{CleanupReport, CreationRetryReport, LotStatus, ProcessReport, RetryReport};
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};

const CANCELLED_MESSAGE: &str = "Lot cancelled by operator";

impl LotOrchestrator {
    /// Reset failed items back to pending so the next dispatch picks them
    /// up.
    ///
    /// Only items whose lot is still open are eligible: items of a failed
    /// lot belong to `reprocess_lot`, and finished lots are immutable. The
    /// retry counter is left as-is here; it only moves on actual dispatch
    /// failures, so the budget bounds real attempts.
    pub async fn retry_failed_messages(&self) -> Result<RetryReport> {
        let mut report = RetryReport::default();

        let items = self
            .store
            .list_failed_items(self.config.max_retries, self.config.retry_limit)
            .await?;

        let mut lot_statuses: HashMap<i64, Option<LotStatus>> = HashMap::new();
        let mut touched = HashSet::new();
        let mut to_reset = Vec::new();

        for item in items {
            let status = match lot_statuses.get(&item.lot_id) {
                Some(status) => *status,
                None => {
                    let status = self.store.get_lot(item.lot_id).await?.map(|l| l.status);
                    lot_statuses.insert(item.lot_id, status);
                    status
                }
            };

            if status == Some(LotStatus::Open) {
                to_reset.push(item.id);
                touched.insert(item.lot_id);
            } else {
                report.items_skipped += 1;
            }
        }

        report.items_reset = self.store.reset_items_to_pending(&to_reset).await?;
        report.lots_touched = touched.len();

        log::info!(
            "Retry run reset {} items across {} lots ({} skipped)",
            report.items_reset,
            report.lots_touched,
            report.items_skipped
        );

        Ok(report)
    }

    /// Re-attempt remote creation for lots stuck in failed_creation. A
    /// recovered lot goes back to open and is dispatched on the next
    /// processing run.
    pub async fn retry_failed_lot_creation(&self) -> Result<CreationRetryReport> {
        let mut report = CreationRetryReport::default();

        for lot in self
            .store
            .list_lots_by_status(LotStatus::FailedCreation)
            .await?
        {
            report.lots_examined += 1;

            if !self.store.claim_lot(lot.id, self.config.lease_secs).await? {
                report.lots_still_failed += 1;
                continue;
            }

            // Reload under the lease: a concurrent retry may already have
            // recovered the lot since it was listed
            let outcome = match self.store.get_lot(lot.id).await? {
                Some(ref current) if current.status == LotStatus::FailedCreation => {
                    self.ensure_remote_lot(current).await
                }
                Some(current) => Ok(current.external_lot_id),
                None => Ok(None),
            };
            self.store.release_lot(lot.id).await?;

            match outcome? {
                Some(_) => report.lots_recovered += 1,
                None => report.lots_still_failed += 1,
            }
        }

        log::info!(
            "Creation retry examined {} lots: {} recovered, {} still failed",
            report.lots_examined,
            report.lots_recovered,
            report.lots_still_failed
        );

        Ok(report)
    }

    /// Cancel a lot: every pending item fails, nothing gets dispatched.
    /// Items already sent stay sent. Finished lots cannot be cancelled.
    pub async fn cancel_lot(&self, id: i64) -> Result<usize> {
        let lot = self
            .store
            .get_lot(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Lot {} not found", id)))?;

        if !matches!(lot.status, LotStatus::Open | LotStatus::Sending) {
            return Err(DispatchError::Invariant(format!(
                "Lot {} cannot be cancelled from status {}",
                id,
                lot.status.as_str()
            )));
        }

        let failed = self
            .store
            .mark_pending_items_failed(id, CANCELLED_MESSAGE)
            .await?;
        self.store
            .set_lot_status(id, LotStatus::Failed, Some(CANCELLED_MESSAGE.to_string()))
            .await?;

        log::info!("Cancelled lot {} ({} pending items failed)", id, failed);

        Ok(failed)
    }

    /// Reopen a failed or finished lot and dispatch it again. Failed items
    /// become pending, sent items are left alone, so a lot that failed
    /// halfway only re-sends the unsent remainder. Lots stuck in
    /// failed_creation go through `retry_failed_lot_creation` instead.
    pub async fn reprocess_lot(&self, id: i64) -> Result<ProcessReport> {
        let lot = self
            .store
            .get_lot(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Lot {} not found", id)))?;

        if !matches!(lot.status, LotStatus::Failed | LotStatus::Finished) {
            return Err(DispatchError::Invariant(format!(
                "Lot {} cannot be reprocessed from status {}",
                id,
                lot.status.as_str()
            )));
        }

        // Claim before mutating anything; a rejected reprocess must leave
        // the lot exactly as it was
        if !self.store.claim_lot(id, self.config.lease_secs).await? {
            return Err(DispatchError::Invariant(format!(
                "Lot {} is claimed by another run",
                id
            )));
        }

        let reset = self.store.reset_failed_items_for_lot(id).await?;
        self.store.set_lot_status(id, LotStatus::Open, None).await?;
        log::info!("Reprocessing lot {}: {} items reset to pending", id, reset);

        let mut report = ProcessReport {
            lots_examined: 1,
            ..Default::default()
        };
        let result = self.dispatch_claimed_lot(id, &mut report).await;
        self.store.release_lot(id).await?;
        result?;

        Ok(report)
    }

    /// Purge finished lots past the retention window, items included
    pub async fn cleanup_finished_lots(&self) -> Result<CleanupReport> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let report = self.store.delete_finished_lots_before(cutoff).await?;

        log::info!(
            "Cleanup removed {} lots and {} items",
            report.lots_deleted,
            report.items_deleted
        );

        Ok(report)
    }
}
