//! Due-lot processing: remote materialization, fan-out and chunked dispatch

use super::LotOrchestrator;
use crate::clients::{user_facing_provider_error, OutboundItem, RemoteLotRequest};
use crate::error::{DispatchError, Result};
use crate::store::NewQueueItem;
use crate::types::{
    Address, Contact, ItemStatus, Lot, LotStatus, LotType, MessageSpec, ProcessReport, QueueItem,
};
use chrono::{Duration, Utc};

impl LotOrchestrator {
    /// Close and dispatch every open lot that is full or past its window.
    ///
    /// Each lot is claimed for the lease duration first; lots held by a
    /// concurrent run are skipped and picked up again once the lease
    /// expires. A lot failure never aborts the run, the remaining lots are
    /// still processed.
    pub async fn process_due_lots(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let now = Utc::now();

        for lot in self.store.list_lots_by_status(LotStatus::Open).await? {
            if !lot.should_close(now) {
                continue;
            }
            report.lots_examined += 1;

            if !self.store.claim_lot(lot.id, self.config.lease_secs).await? {
                log::debug!("Lot {} is claimed by another run, skipping", lot.id);
                report.lots_skipped_claimed += 1;
                continue;
            }

            let result = self.dispatch_claimed_lot(lot.id, &mut report).await;
            self.store.release_lot(lot.id).await?;
            result?;
        }

        log::info!(
            "Processed {} due lots: {} finished, {} failed, {} skipped (claimed), \
             {} items sent, {} items failed",
            report.lots_examined,
            report.lots_finished,
            report.lots_failed,
            report.lots_skipped_claimed,
            report.items_sent,
            report.items_failed
        );

        Ok(report)
    }

    /// Force-close a single open lot now, regardless of its window
    pub async fn process_lot(&self, id: i64) -> Result<ProcessReport> {
        let lot = self
            .store
            .get_lot(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Lot {} not found", id)))?;

        if lot.status != LotStatus::Open {
            return Err(DispatchError::Invariant(format!(
                "Lot {} cannot be processed from status {}",
                id,
                lot.status.as_str()
            )));
        }

        if !self.store.claim_lot(id, self.config.lease_secs).await? {
            return Err(DispatchError::Invariant(format!(
                "Lot {} is claimed by another run",
                id
            )));
        }

        let mut report = ProcessReport {
            lots_examined: 1,
            ..Default::default()
        };
        let result = self.dispatch_claimed_lot(id, &mut report).await;
        self.store.release_lot(id).await?;
        result?;

        Ok(report)
    }

    /// Dispatch one claimed lot end to end. Provider failures are recorded
    /// on the lot and its items; only store failures propagate.
    ///
    /// The lot is reloaded here, after the lease claim. A listing snapshot
    /// taken before the claim can predate another run that already created
    /// the remote lot or failed it; the creation guard must see the current
    /// row.
    pub(super) async fn dispatch_claimed_lot(
        &self,
        lot_id: i64,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let lot = self
            .store
            .get_lot(lot_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Lot {} not found", lot_id)))?;

        if lot.status != LotStatus::Open {
            log::debug!(
                "Lot {} moved to {} before dispatch, leaving it alone",
                lot.id,
                lot.status.as_str()
            );
            return Ok(());
        }

        let pending = self.store.list_pending_items(lot.id).await?;

        // A lot that closed empty never existed remotely; nothing to create
        // or finish there
        if pending.is_empty() && lot.external_lot_id.is_none() {
            self.store
                .set_lot_status(lot.id, LotStatus::Finished, None)
                .await?;
            report.lots_finished += 1;
            log::info!("Lot {} closed empty, no remote lot created", lot.id);
            return Ok(());
        }

        let external_id = match self.ensure_remote_lot(&lot).await? {
            Some(id) => id,
            None => {
                report.lots_failed += 1;
                return Ok(());
            }
        };

        self.fan_out(&lot, pending, report).await?;

        let pending = self.store.list_pending_items(lot.id).await?;
        let mut deliverable = Vec::with_capacity(pending.len());
        for item in &pending {
            match self.build_outbound(&lot, item) {
                Ok(outbound) => deliverable.push((item.id, outbound)),
                Err(e) => {
                    self.store
                        .mark_items_failed(&[item.id], &e.to_string(), true)
                        .await?;
                    report.items_failed += 1;
                }
            }
        }

        self.store
            .set_lot_status(lot.id, LotStatus::Sending, None)
            .await?;

        for chunk in deliverable.chunks(self.chunk_size) {
            let ids: Vec<i64> = chunk.iter().map(|(id, _)| *id).collect();
            let items: Vec<OutboundItem> =
                chunk.iter().map(|(_, outbound)| outbound.clone()).collect();

            match self.api.add_items(&external_id, &items).await {
                Ok(()) => {
                    self.store.mark_items_sent(&ids, Utc::now()).await?;
                    report.items_sent += ids.len();
                }
                Err(e) => {
                    // A chunk is all-or-nothing on the provider side. Later
                    // chunks stay pending for a reprocess.
                    let message = user_facing_provider_error(&e.to_string());
                    self.store.mark_items_failed(&ids, &message, true).await?;
                    self.store
                        .set_lot_status(lot.id, LotStatus::Failed, Some(message.clone()))
                        .await?;
                    report.items_failed += ids.len();
                    report.lots_failed += 1;
                    log::error!("Lot {} failed during dispatch: {}", lot.id, message);
                    return Ok(());
                }
            }
        }

        match self.api.finish_lot(&external_id).await {
            Ok(()) => {
                self.store
                    .set_lot_status(lot.id, LotStatus::Finished, None)
                    .await?;
            }
            Err(e) => {
                // Every item was accepted; the lot is done from our side
                // even though the remote close failed. Record the error.
                let message = format!(
                    "Remote finish failed after all items were sent: {}",
                    user_facing_provider_error(&e.to_string())
                );
                log::error!("Lot {}: {}", lot.id, message);
                self.store
                    .set_lot_status(lot.id, LotStatus::Finished, Some(message))
                    .await?;
            }
        }

        report.lots_finished += 1;
        log::info!("Lot {} finished ({})", lot.id, external_id);

        Ok(())
    }

    /// Materialize the lot remotely if it has no external id yet. The send
    /// window starts now, not at enqueue time.
    pub(super) async fn ensure_remote_lot(&self, lot: &Lot) -> Result<Option<String>> {
        if let Some(id) = &lot.external_lot_id {
            return Ok(Some(id.clone()));
        }

        self.store
            .set_lot_status(lot.id, LotStatus::Creating, None)
            .await?;

        let now = Utc::now();
        let request = RemoteLotRequest {
            name: lot.create_payload.name.clone(),
            date_start: now,
            date_end: now + Duration::seconds(lot.time_window_secs),
            id_quota_settings: lot.id_quota_settings,
            id_service_settings: lot.id_service_settings,
            service_type: lot.service_type,
            custom_fields: lot.create_payload.extra.clone(),
        };

        match self.api.create_lot(&request).await {
            Ok(external_id) => {
                self.store
                    .set_external_lot_id(lot.id, external_id.clone())
                    .await?;
                self.store
                    .set_lot_status(lot.id, LotStatus::Open, None)
                    .await?;
                log::info!("Lot {} created remotely as {}", lot.id, external_id);
                Ok(Some(external_id))
            }
            Err(e) => {
                let message = user_facing_provider_error(&e.to_string());
                log::error!("Remote creation of lot {} failed: {}", lot.id, message);
                self.store
                    .set_lot_status(lot.id, LotStatus::FailedCreation, Some(message))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Resolve placeholder items into concrete addresses. The first
    /// candidate reuses the placeholder row; further candidates become new
    /// pending items. Fan-out rows do not bump the lot counter, which only
    /// tracks enqueued contacts.
    async fn fan_out(
        &self,
        lot: &Lot,
        pending: Vec<QueueItem>,
        report: &mut ProcessReport,
    ) -> Result<()> {
        for item in pending {
            if item.payload.address.is_some() {
                continue;
            }

            let contact = Contact {
                id: item.contact_id.clone(),
                name: item.payload.contact_name.clone(),
                fields: item.payload.fields.clone(),
            };

            match self
                .addresses
                .resolve(&contact, &lot.create_payload.address, lot.lot_type)
                .await
            {
                Ok(addresses) => {
                    let mut candidates = addresses.into_iter();
                    let Some(first) = candidates.next() else {
                        continue;
                    };

                    let mut payload = item.payload.clone();
                    payload.address = Some(first.clone());
                    self.store
                        .update_item_payload(item.id, &payload, Some(&first.dedup_key()))
                        .await?;

                    for address in candidates {
                        let key = address.dedup_key();
                        if self
                            .store
                            .find_pending_item(lot.id, &item.contact_id, Some(&key))
                            .await?
                            .is_some()
                        {
                            continue;
                        }

                        let mut payload = item.payload.clone();
                        payload.address = Some(address);
                        self.store
                            .insert_item(NewQueueItem {
                                lot_id: lot.id,
                                contact_id: item.contact_id.clone(),
                                address_key: Some(key),
                                payload,
                                status: ItemStatus::Pending,
                                error_message: None,
                            })
                            .await?;
                    }
                }
                Err(e) if e.is_contact_data() => {
                    self.store
                        .mark_items_failed(&[item.id], &e.to_string(), true)
                        .await?;
                    report.items_failed += 1;
                }
                Err(DispatchError::Provider(message)) => {
                    // Lookup outage fails the item, not the lot; a retry run
                    // picks it up again
                    self.store
                        .mark_items_failed(&[item.id], &message, true)
                        .await?;
                    report.items_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn build_outbound(&self, lot: &Lot, item: &QueueItem) -> Result<OutboundItem> {
        let address = item.payload.address.as_ref().ok_or_else(|| {
            DispatchError::Invariant(format!(
                "Item {} reached dispatch without an address",
                item.id
            ))
        })?;

        match (lot.lot_type, address) {
            (LotType::Message, Address::Phone { area_code, number }) => {
                let service_type = lot.service_type.ok_or_else(|| {
                    DispatchError::Invariant(format!(
                        "Message lot {} has no service type",
                        lot.id
                    ))
                })?;

                let (text, template_id) = match &lot.create_payload.message {
                    Some(MessageSpec::Text { text }) => (Some(text.clone()), None),
                    Some(MessageSpec::Template { template_id }) => {
                        (None, Some(template_id.clone()))
                    }
                    None => {
                        return Err(DispatchError::Invariant(format!(
                            "Message lot {} has no message content",
                            lot.id
                        )))
                    }
                };

                Ok(OutboundItem::Phone {
                    service_type,
                    text,
                    template_id,
                    area_code: area_code.clone(),
                    phone: number.clone(),
                    variables: item.payload.extra.clone(),
                })
            }
            (LotType::Email, Address::Email { address }) => {
                let envelope = lot.create_payload.email.as_ref().ok_or_else(|| {
                    DispatchError::Invariant(format!("Email lot {} has no envelope", lot.id))
                })?;

                Ok(OutboundItem::Email {
                    from: envelope.from.clone(),
                    to: address.clone(),
                    subject: envelope.subject.clone(),
                    body: envelope.body.clone(),
                    cc: envelope.cc.clone(),
                    variables: item.payload.extra.clone(),
                })
            }
            _ => Err(DispatchError::Invariant(format!(
                "Item {} address kind does not match lot type",
                item.id
            ))),
        }
    }
}
