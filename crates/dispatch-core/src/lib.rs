//! Bulk-messaging dispatch core
//!
//! Batches per-contact messages into provider lots and drives them through
//! their lifecycle: local accumulation, deferred remote creation, chunked
//! dispatch and explicit finish, plus retry and retention maintenance.

pub mod clients;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod services;
pub mod store;
pub mod types;

pub use clients::{BulkMessagingApi, BulkMessagingClient, PhoneLookup, PhoneLookupClient};
pub use config::DispatchConfig;
pub use error::{DispatchError, Result};
pub use orchestrator::LotOrchestrator;
pub use services::{AddressResolver, RouteResolver};
pub use store::{LotStore, SqliteLotStore};
