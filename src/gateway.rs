//! Ingestion gateway - turns meter readings into stored, ledger-confirmed predictions
//!
//! Per-reading state machine:
//!
//! ```text
//! Received -> Resolved -> Priced -> Stored -> LedgerPending -> Confirmed
//!                                                          \-> LedgerFailed
//! ```
//!
//! Everything up to `Stored` runs on the caller's task. Confirmation is a
//! detached tokio task; nothing retries it. By default the number of
//! in-flight confirmations is unbounded; `max_in_flight` puts a semaphore in
//! front of the spawn so ingestion waits when the bound is reached.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ledger::LedgerService;
use crate::models::{MeterReading, NewPrediction, Prediction};
use crate::pricing::{PriceQuery, PricingEngine, PricingError};
use crate::registry::{MeterRegistry, ResolveError};
use crate::store::{PredictionStore, StoreError};

/// Confirmation section of the node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Upper bound on concurrent confirmation tasks; unset means unbounded
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingStage {
    Received,
    Resolved,
    Priced,
    Stored,
    LedgerPending,
    Confirmed,
    LedgerFailed,
}

impl ReadingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStage::Received => "received",
            ReadingStage::Resolved => "resolved",
            ReadingStage::Priced => "priced",
            ReadingStage::Stored => "stored",
            ReadingStage::LedgerPending => "ledger_pending",
            ReadingStage::Confirmed => "confirmed",
            ReadingStage::LedgerFailed => "ledger_failed",
        }
    }
}

impl fmt::Display for ReadingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reading was dropped without creating a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownMeter,
    NonFiniteMeasurement,
    /// Finite but too large to price
    ImplausibleMeasurement,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("household lookup failed for {meter_id}: {source}")]
    Resolve {
        meter_id: String,
        #[source]
        source: ResolveError,
    },

    #[error("pricing failed for {meter_id}: {source}")]
    Pricing {
        meter_id: String,
        #[source]
        source: PricingError,
    },

    #[error("failed to store prediction for {meter_id}: {source}")]
    Persist {
        meter_id: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// Last stage the reading reached before failing
    pub fn stage(&self) -> ReadingStage {
        match self {
            IngestError::Resolve { .. } => ReadingStage::Received,
            IngestError::Pricing { .. } => ReadingStage::Resolved,
            IngestError::Persist { .. } => ReadingStage::Priced,
        }
    }
}

/// Final state of a detached confirmation task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { tx_hash: String },
    Failed { reason: String },
}

/// Handle on a detached confirmation. Dropping it leaves the task running.
#[derive(Debug)]
pub struct ConfirmationHandle(JoinHandle<Confirmation>);

impl ConfirmationHandle {
    pub async fn wait(self) -> Confirmation {
        match self.0.await {
            Ok(confirmation) => confirmation,
            Err(e) => Confirmation::Failed {
                reason: format!("confirmation task aborted: {}", e),
            },
        }
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Dropped {
        meter_id: String,
        reason: DropReason,
    },
    Accepted {
        prediction: Prediction,
        /// The device timestamp was unparsable and ingestion time was used
        used_fallback_timestamp: bool,
        confirmation: ConfirmationHandle,
    },
}

impl IngestOutcome {
    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            IngestOutcome::Accepted { prediction, .. } => Some(prediction),
            IngestOutcome::Dropped { .. } => None,
        }
    }
}

pub struct IngestionGateway {
    registry: MeterRegistry,
    pricing: PricingEngine,
    predictions: Arc<dyn PredictionStore>,
    ledger: Arc<LedgerService>,
    admission: Option<Arc<Semaphore>>,
}

impl IngestionGateway {
    pub fn new(
        registry: MeterRegistry,
        pricing: PricingEngine,
        predictions: Arc<dyn PredictionStore>,
        ledger: Arc<LedgerService>,
        confirmation: &ConfirmationConfig,
    ) -> Self {
        Self {
            registry,
            pricing,
            predictions,
            ledger,
            admission: confirmation
                .max_in_flight
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    /// Run one reading through the pipeline up to `Stored` and dispatch its
    /// ledger confirmation.
    pub async fn ingest(&self, reading: MeterReading) -> Result<IngestOutcome, IngestError> {
        let meter_id = reading.meter_id.clone();
        debug!(meter_id = %meter_id, stage = %ReadingStage::Received, "Reading received");

        if !reading.has_finite_measurements() {
            warn!(meter_id = %meter_id, "Dropping reading with non-finite measurements");
            return Ok(IngestOutcome::Dropped {
                meter_id,
                reason: DropReason::NonFiniteMeasurement,
            });
        }

        let household = match self.registry.resolve(&meter_id).await {
            Ok(household) => {
                debug!(
                    meter_id = %meter_id,
                    household_id = %household.id,
                    stage = %ReadingStage::Resolved,
                    "Meter resolved"
                );
                household
            }
            Err(ResolveError::UnknownMeter(_)) => {
                warn!(meter_id = %meter_id, "Dropping reading from unknown meter");
                return Ok(IngestOutcome::Dropped {
                    meter_id,
                    reason: DropReason::UnknownMeter,
                });
            }
            Err(source) => {
                error!(meter_id = %meter_id, error = %source, "Household lookup failed");
                return Err(IngestError::Resolve { meter_id, source });
            }
        };

        let (timestamp, used_fallback_timestamp) = match reading.parsed_timestamp() {
            Some(ts) => (ts, false),
            None => {
                debug!(
                    meter_id = %meter_id,
                    raw = %reading.timestamp,
                    "Unparsable reading timestamp, using ingestion time"
                );
                (Utc::now(), true)
            }
        };

        let query = match PriceQuery::at(timestamp, reading.temperature, reading.consumption_kwh) {
            Ok(query) => query,
            Err(PricingError::ConsumptionOutOfRange(kwh)) => {
                warn!(meter_id = %meter_id, consumption_kwh = kwh, "Dropping reading with implausible consumption");
                return Ok(IngestOutcome::Dropped {
                    meter_id,
                    reason: DropReason::ImplausibleMeasurement,
                });
            }
            Err(source) => return Err(IngestError::Pricing { meter_id, source }),
        };
        let quote = self.pricing.predict(Some(&household), &query);
        debug!(
            meter_id = %meter_id,
            stage = %ReadingStage::Priced,
            price = quote.price,
            confidence = quote.confidence,
            "Reading priced"
        );

        let new_prediction = NewPrediction {
            user_id: household.user_id,
            household_id: household.id.clone(),
            meter_id: meter_id.clone(),
            timestamp,
            hour: query.hour(),
            temperature: reading.temperature,
            consumption_kwh: reading.consumption_kwh,
            predicted_price: quote.price,
            confidence: quote.confidence,
            actual_price: Some(self.pricing.actual_price(quote.price, query.hour())),
        };

        let prediction = match self.predictions.create(new_prediction).await {
            Ok(prediction) => prediction,
            Err(source) => {
                error!(meter_id = %meter_id, error = %source, "Failed to store prediction");
                return Err(IngestError::Persist { meter_id, source });
            }
        };
        info!(
            meter_id = %meter_id,
            prediction_id = prediction.id,
            stage = %ReadingStage::Stored,
            price = prediction.predicted_price,
            confidence = prediction.confidence,
            "Prediction stored"
        );

        debug!(
            prediction_id = prediction.id,
            stage = %ReadingStage::LedgerPending,
            "Dispatching ledger confirmation"
        );
        let confirmation = self.dispatch_confirmation(prediction.clone()).await;

        Ok(IngestOutcome::Accepted {
            prediction,
            used_fallback_timestamp,
            confirmation,
        })
    }

    async fn dispatch_confirmation(&self, prediction: Prediction) -> ConfirmationHandle {
        // The semaphore is never closed, so acquiring only waits
        let permit = match &self.admission {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let ledger = self.ledger.clone();
        let predictions = self.predictions.clone();

        ConfirmationHandle(tokio::spawn(async move {
            let outcome = confirm(&ledger, predictions.as_ref(), &prediction).await;
            drop(permit);
            outcome
        }))
    }
}

async fn confirm(
    ledger: &LedgerService,
    predictions: &dyn PredictionStore,
    prediction: &Prediction,
) -> Confirmation {
    let tx_hash = match ledger.append(prediction).await {
        Ok(tx_hash) => tx_hash,
        Err(e) => {
            error!(
                prediction_id = prediction.id,
                stage = %ReadingStage::LedgerFailed,
                error = %e,
                "Ledger append failed, prediction stays unconfirmed"
            );
            return Confirmation::Failed {
                reason: e.to_string(),
            };
        }
    };

    if let Err(e) = predictions
        .update_confirmation(prediction.id, &tx_hash)
        .await
    {
        error!(
            prediction_id = prediction.id,
            tx_hash = %tx_hash,
            stage = %ReadingStage::LedgerFailed,
            error = %e,
            "Failed to record ledger confirmation"
        );
        return Confirmation::Failed {
            reason: e.to_string(),
        };
    }

    info!(
        prediction_id = prediction.id,
        tx_hash = %tx_hash,
        stage = %ReadingStage::Confirmed,
        "Prediction confirmed on ledger"
    );
    Confirmation::Confirmed { tx_hash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::models::{HeatingType, HouseholdContext, HouseholdStatus};
    use crate::pricing::VolatilitySource;
    use crate::store::MemoryStore;

    async fn gateway(store: Arc<MemoryStore>, max_in_flight: Option<usize>) -> IngestionGateway {
        let registry = MeterRegistry::new(store.clone());
        registry
            .register(HouseholdContext {
                id: "house_001".to_string(),
                user_id: 5,
                meter_id: "m1".to_string(),
                region: "Piemonte".to_string(),
                city: "Torino".to_string(),
                members: 3,
                area_sqm: 80.0,
                year_built: 2005,
                heating_type: HeatingType::Electric,
                status: HouseholdStatus::Active,
            })
            .await
            .unwrap();

        let ledger = Arc::new(LedgerService::new(LedgerConfig::default(), store.clone()));
        IngestionGateway::new(
            registry,
            PricingEngine::new(VolatilitySource::Fixed(3)),
            store,
            ledger,
            &ConfirmationConfig { max_in_flight },
        )
    }

    fn reading(timestamp: &str) -> MeterReading {
        MeterReading {
            meter_id: "m1".to_string(),
            timestamp: timestamp.to_string(),
            temperature: 12.0,
            consumption_kwh: 0.9,
        }
    }

    #[tokio::test]
    async fn test_accepted_reading_is_confirmed() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store.clone(), None).await;

        let outcome = gateway.ingest(reading("2024-03-10T08:15:00Z")).await.unwrap();
        let IngestOutcome::Accepted {
            prediction,
            used_fallback_timestamp,
            confirmation,
        } = outcome
        else {
            panic!("reading should be accepted");
        };
        assert!(!used_fallback_timestamp);
        assert_eq!(prediction.hour, 8);
        assert!(!prediction.ledger_confirmed);

        let Confirmation::Confirmed { tx_hash } = confirmation.wait().await else {
            panic!("confirmation should succeed");
        };
        let stored = store.find(prediction.id).await.unwrap().unwrap();
        assert!(stored.ledger_confirmed);
        assert_eq!(stored.ledger_tx, Some(tx_hash));
    }

    #[tokio::test]
    async fn test_unparsable_timestamp_falls_back_to_now() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store, None).await;

        let outcome = gateway.ingest(reading("not a time")).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted {
                used_fallback_timestamp: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_finite_reading_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store.clone(), None).await;

        let mut bad = reading("2024-03-10T08:15:00Z");
        bad.temperature = f64::NAN;
        let outcome = gateway.ingest(bad).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Dropped {
                reason: DropReason::NonFiniteMeasurement,
                ..
            }
        ));
        assert!(store.predictions().await.is_empty());
    }

    #[tokio::test]
    async fn test_huge_consumption_is_dropped_not_priced() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store.clone(), None).await;

        let mut huge = reading("2024-03-10T08:15:00Z");
        huge.consumption_kwh = 1e308;
        let outcome = gateway.ingest(huge).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Dropped {
                reason: DropReason::ImplausibleMeasurement,
                ..
            }
        ));
        assert!(store.predictions().await.is_empty());
        assert_eq!(gateway.ledger.stats().await.total_transactions, 0);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_before_ledger() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store.clone(), Some(2)).await;
        store.fail_next_prediction_create();

        let err = gateway
            .ingest(reading("2024-03-10T08:15:00Z"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), ReadingStage::Priced);
        assert_eq!(gateway.ledger.stats().await.total_transactions, 0);
    }
}
