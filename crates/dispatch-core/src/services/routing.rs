//! Route and quota resolution with a TTL cache
//!
//! Routes change rarely but are consulted on every message-lot acquisition,
//! so responses are cached per (booking, crm, service type) for a few hours.

use crate::clients::BulkMessagingApi;
use crate::error::{DispatchError, Result};
use crate::types::{EnqueueContext, Route, ServiceType};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct CachedRoutes {
    routes: Vec<Route>,
    fetched_at: DateTime<Utc>,
}

pub struct RouteResolver {
    api: Arc<dyn BulkMessagingApi>,
    ttl_secs: i64,
    cache: Mutex<HashMap<(String, String, ServiceType), CachedRoutes>>,
}

impl RouteResolver {
    pub fn new(api: Arc<dyn BulkMessagingApi>, ttl_secs: i64) -> Self {
        Self {
            api,
            ttl_secs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Routes for the context, from cache when fresh
    pub async fn get_routes(
        &self,
        booking_id: &str,
        crm_id: &str,
        service_type: ServiceType,
    ) -> Result<Vec<Route>> {
        let key = (booking_id.to_string(), crm_id.to_string(), service_type);

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                let age = Utc::now() - entry.fetched_at;
                if age < Duration::seconds(self.ttl_secs) {
                    log::debug!(
                        "Using cached routes for booking {} ({})",
                        booking_id,
                        service_type
                    );
                    return Ok(entry.routes.clone());
                }
            }
        }

        log::debug!(
            "Fetching routes for booking {} crm {} ({})",
            booking_id,
            crm_id,
            service_type
        );

        let routes = self.api.get_routes(booking_id, crm_id, service_type).await?;

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key,
            CachedRoutes {
                routes: routes.clone(),
                fetched_at: Utc::now(),
            },
        );

        Ok(routes)
    }

    /// Quota settings id for the service-settings route of the context.
    ///
    /// Fails with a configuration error when no available route matches the
    /// context's service settings, or when the matching route carries no
    /// quota settings. Callers must surface this before persisting anything.
    pub async fn resolve_quota_settings(
        &self,
        context: &EnqueueContext,
        service_type: ServiceType,
    ) -> Result<i64> {
        let routes = self
            .get_routes(&context.booking_id, &context.crm_id, service_type)
            .await?;

        let route = routes
            .iter()
            .find(|r| r.available && r.id_service_settings == context.service_settings_id)
            .ok_or_else(|| {
                DispatchError::Config(format!(
                    "No available {} route for service settings {} (booking {})",
                    service_type, context.service_settings_id, context.booking_id
                ))
            })?;

        route.id_quota_settings.ok_or_else(|| {
            DispatchError::Config(format!(
                "Route '{}' for service settings {} has no quota settings configured",
                route.name, context.service_settings_id
            ))
        })
    }

    #[cfg(test)]
    fn inject_cached_routes(
        &self,
        booking_id: &str,
        crm_id: &str,
        service_type: ServiceType,
        routes: Vec<Route>,
        fetched_at: DateTime<Utc>,
    ) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            (booking_id.to_string(), crm_id.to_string(), service_type),
            CachedRoutes { routes, fetched_at },
        );
    }
}
