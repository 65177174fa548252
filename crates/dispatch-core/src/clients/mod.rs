//! Remote service clients

pub mod phone_lookup;
pub mod provider;

pub use phone_lookup::{PhoneLookup, PhoneLookupClient};
pub use provider::{
    user_facing_provider_error, BulkMessagingApi, BulkMessagingClient, OutboundItem,
    RemoteLotRequest, MAX_ITEMS_PER_CALL,
};
