//! Meter registry - resolves a meter id to the household that owns it
//!
//! Archived households still resolve: readings from them are priced and
//! logged like any other.

use std::sync::Arc;

use tracing::{debug, info};

use crate::models::HouseholdContext;
use crate::store::{HouseholdStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown meter: {0}")]
    UnknownMeter(String),

    #[error("registry lookup failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct MeterRegistry {
    store: Arc<dyn HouseholdStore>,
}

impl MeterRegistry {
    pub fn new(store: Arc<dyn HouseholdStore>) -> Self {
        Self { store }
    }

    /// Look up the household for a meter. Read-only, no side effects on a miss.
    pub async fn resolve(&self, meter_id: &str) -> Result<HouseholdContext, ResolveError> {
        match self.store.find_by_meter(meter_id).await? {
            Some(household) => {
                if household.is_archived() {
                    debug!(meter_id = %meter_id, household_id = %household.id, "Resolved archived household");
                }
                Ok(household)
            }
            None => Err(ResolveError::UnknownMeter(meter_id.to_string())),
        }
    }

    pub async fn register(&self, household: HouseholdContext) -> Result<(), StoreError> {
        self.store.upsert(household).await
    }

    /// Register every household in `households`, returning how many were stored
    pub async fn seed(&self, households: &[HouseholdContext]) -> Result<usize, StoreError> {
        for household in households {
            self.register(household.clone()).await?;
        }
        if !households.is_empty() {
            info!(count = households.len(), "Seeded households into registry");
        }
        Ok(households.len())
    }
}
