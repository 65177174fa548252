//! Lot lifecycle orchestration
//!
//! The orchestrator owns the state machine: lots are acquired and filled at
//! enqueue time, then materialized remotely and dispatched when they become
//! due. Remote calls happen only at dispatch time; enqueueing is pure local
//! bookkeeping plus route resolution.

mod dispatch;
mod maintenance;

use crate::clients::{BulkMessagingApi, PhoneLookup, MAX_ITEMS_PER_CALL};
use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::services::{AddressResolver, RouteResolver};
use crate::store::{LotStore, NewLot, NewQueueItem};
use crate::types::{
    AddressSource, CampaignConfig, Contact, CreateLotPayload, EnqueueContext, EnqueueOutcome,
    ItemPayload, ItemStatus, Lot, LotBinding, LotStatus, LotType,
};
use std::sync::Arc;
use uuid::Uuid;

pub struct LotOrchestrator {
    store: Arc<dyn LotStore>,
    api: Arc<dyn BulkMessagingApi>,
    routes: RouteResolver,
    addresses: AddressResolver,
    config: OrchestratorConfig,
    chunk_size: usize,
}

impl LotOrchestrator {
    pub fn new(
        store: Arc<dyn LotStore>,
        api: Arc<dyn BulkMessagingApi>,
        lookup: Arc<dyn PhoneLookup>,
        config: OrchestratorConfig,
    ) -> Self {
        let routes = RouteResolver::new(api.clone(), config.route_cache_ttl_secs);
        let addresses = AddressResolver::new(lookup, &config);

        Self {
            store,
            api,
            routes,
            addresses,
            config,
            chunk_size: MAX_ITEMS_PER_CALL,
        }
    }

    #[cfg(test)]
    fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// The open lot items for this campaign context should land in, creating
    /// one when none exists.
    ///
    /// For message lots the quota settings are resolved from the provider's
    /// routes first; an unresolvable quota is a configuration error and no
    /// lot is created. Lots only match when every binding key agrees, so
    /// items never leak across campaigns, events or routes.
    pub async fn get_or_create_active_lot(
        &self,
        context: &EnqueueContext,
        campaign: &CampaignConfig,
    ) -> Result<Lot> {
        let (service_type, id_quota_settings) = match campaign.lot_type {
            LotType::Message => {
                let service_type = campaign.service_type.ok_or_else(|| {
                    DispatchError::Config(
                        "Message campaigns require a service type".to_string(),
                    )
                })?;
                let quota = self
                    .routes
                    .resolve_quota_settings(context, service_type)
                    .await?;
                (Some(service_type), Some(quota))
            }
            LotType::Email => (None, None),
        };

        let binding = LotBinding {
            campaign_id: context.campaign_id.clone(),
            event_id: context.event_id.clone(),
            id_quota_settings,
            id_service_settings: context.service_settings_id,
            service_type,
            lot_type: campaign.lot_type,
        };

        if let Some(lot) = self.store.find_open_lot(&binding).await? {
            // A lot already due to close takes no more contacts; it will be
            // picked up by the next processing run
            if !lot.should_close(chrono::Utc::now()) {
                return Ok(lot);
            }
        }

        let prefix = campaign
            .lot_name
            .clone()
            .unwrap_or_else(|| context.campaign_id.clone());
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", prefix, &suffix[..8]);

        let create_payload = CreateLotPayload {
            name,
            lot_type: campaign.lot_type,
            service_type,
            id_quota_settings,
            id_service_settings: context.service_settings_id,
            address: campaign.address.clone(),
            message: campaign.message.clone(),
            email: campaign.email.clone(),
            extra: campaign.custom_fields.clone(),
        };

        let lot = self
            .store
            .create_lot(NewLot {
                lot_type: campaign.lot_type,
                service_type,
                campaign_id: context.campaign_id.clone(),
                event_id: context.event_id.clone(),
                id_quota_settings,
                id_service_settings: context.service_settings_id,
                status: LotStatus::Open,
                batch_size: campaign.batch_size.unwrap_or(self.config.batch_size),
                time_window_secs: campaign
                    .time_window_secs
                    .unwrap_or(self.config.time_window_secs),
                create_payload,
            })
            .await?;

        log::info!(
            "Opened lot {} for campaign {} ({})",
            lot.id,
            lot.campaign_id,
            lot.lot_type.as_str()
        );

        Ok(lot)
    }

    /// Enqueue one contact into an open lot.
    ///
    /// Addresses readable at enqueue time (contact field, collection field)
    /// are resolved now and deduplicated per address key. Lookup-sourced
    /// contacts get a single placeholder row resolved at dispatch time. A
    /// contact with no usable address still produces a row, as failed, so
    /// lot statistics account for it; the operation itself succeeds.
    pub async fn enqueue_contact(&self, lot: &Lot, contact: &Contact) -> Result<EnqueueOutcome> {
        if lot.status != LotStatus::Open {
            return Err(DispatchError::Invariant(format!(
                "Lot {} is not open for enqueueing ({})",
                lot.id,
                lot.status.as_str()
            )));
        }

        let address_config = &lot.create_payload.address;

        if let AddressSource::ExternalLookup { .. } = address_config.source {
            if self
                .store
                .find_pending_item(lot.id, &contact.id, None)
                .await?
                .is_some()
            {
                return Ok(EnqueueOutcome::Skipped);
            }

            let item = self
                .store
                .insert_item(NewQueueItem {
                    lot_id: lot.id,
                    contact_id: contact.id.clone(),
                    address_key: None,
                    payload: self.snapshot_payload(contact, None),
                    status: ItemStatus::Pending,
                    error_message: None,
                })
                .await?;
            self.store.increment_messages_count(lot.id).await?;

            return Ok(EnqueueOutcome::Enqueued(vec![item]));
        }

        match self
            .addresses
            .resolve(contact, address_config, lot.lot_type)
            .await
        {
            Ok(addresses) => {
                let mut inserted = Vec::new();
                for address in addresses {
                    let key = address.dedup_key();
                    if self
                        .store
                        .find_pending_item(lot.id, &contact.id, Some(&key))
                        .await?
                        .is_some()
                    {
                        continue;
                    }

                    let item = self
                        .store
                        .insert_item(NewQueueItem {
                            lot_id: lot.id,
                            contact_id: contact.id.clone(),
                            address_key: Some(key),
                            payload: self.snapshot_payload(contact, Some(address)),
                            status: ItemStatus::Pending,
                            error_message: None,
                        })
                        .await?;
                    self.store.increment_messages_count(lot.id).await?;
                    inserted.push(item);
                }

                if inserted.is_empty() {
                    Ok(EnqueueOutcome::Skipped)
                } else {
                    Ok(EnqueueOutcome::Enqueued(inserted))
                }
            }
            Err(e) if e.is_contact_data() => {
                // Repeat enqueues of the same undeliverable contact keep a
                // single failed row and a single counter bump
                if self
                    .store
                    .find_failed_placeholder(lot.id, &contact.id)
                    .await?
                    .is_some()
                {
                    return Ok(EnqueueOutcome::Skipped);
                }

                log::warn!("Contact {} not deliverable: {}", contact.id, e);

                let item = self
                    .store
                    .insert_item(NewQueueItem {
                        lot_id: lot.id,
                        contact_id: contact.id.clone(),
                        address_key: None,
                        payload: self.snapshot_payload(contact, None),
                        status: ItemStatus::Failed,
                        error_message: Some(e.to_string()),
                    })
                    .await?;
                self.store.increment_messages_count(lot.id).await?;

                Ok(EnqueueOutcome::FailedAddress(item))
            }
            Err(e) => Err(e),
        }
    }

    fn snapshot_payload(
        &self,
        contact: &Contact,
        address: Option<crate::types::Address>,
    ) -> ItemPayload {
        ItemPayload {
            address,
            contact_name: contact.name.clone(),
            fields: contact.fields.clone(),
            extra: std::collections::HashMap::new(),
        }
    }
}
