//! Service wiring shared by the binary, the HTTP layer and integration tests

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::IngestionGateway;
use crate::ledger::LedgerService;
use crate::pricing::PricingEngine;
use crate::query::LedgerQuery;
use crate::registry::MeterRegistry;
use crate::store::{StoreError, Stores};

/// Every long-lived service of a node, constructed once at startup
#[derive(Clone)]
pub struct Services {
    pub registry: MeterRegistry,
    pub ledger: Arc<LedgerService>,
    pub gateway: Arc<IngestionGateway>,
    pub query: LedgerQuery,
}

impl Services {
    pub fn build(config: &Config, stores: Stores) -> Self {
        let registry = MeterRegistry::new(stores.households.clone());
        let ledger = Arc::new(LedgerService::new(
            config.ledger.clone(),
            stores.ledger_logs.clone(),
        ));

        let gateway = Arc::new(IngestionGateway::new(
            registry.clone(),
            PricingEngine::new(config.pricing.volatility),
            stores.predictions.clone(),
            ledger.clone(),
            &config.confirmation,
        ));

        let query = LedgerQuery::new(ledger.clone(), stores.predictions, stores.ledger_logs);

        Self {
            registry,
            ledger,
            gateway,
            query,
        }
    }

    /// Register the households declared in config
    pub async fn seed(&self, config: &Config) -> Result<usize, StoreError> {
        self.registry.seed(&config.households).await
    }
}
