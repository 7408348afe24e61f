//! Ingestion pipeline integration tests
//!
//! Runs readings end to end through registry, pricing, record store and
//! ledger:
//! - Unknown meters are dropped without side effects
//! - Concurrent readings produce a gap-free, well-linked chain
//! - Confirmation flags match ledger contents
//! - Failure paths leave predictions unconfirmed

use std::sync::Arc;

use futures::future::join_all;
use pulse_node::config::Config;
use pulse_node::gateway::{Confirmation, DropReason, IngestOutcome};
use pulse_node::models::{HeatingType, HouseholdContext, HouseholdStatus, MeterReading};
use pulse_node::pricing::{PricingMode, VolatilitySource, CONFIDENCE_MAX, CONFIDENCE_MIN};
use pulse_node::store::{MemoryStore, PredictionStore, SqliteStore, Stores};
use pulse_node::Services;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn household(index: usize, status: HouseholdStatus) -> HouseholdContext {
    HouseholdContext {
        id: format!("house_{:03}", index),
        user_id: (index % 3) as i64 + 1,
        meter_id: format!("household_{}", index),
        region: "Lazio".to_string(),
        city: "Roma".to_string(),
        members: 5,
        area_sqm: 200.0,
        year_built: 1975,
        heating_type: HeatingType::NaturalGas,
        status,
    }
}

fn config(max_in_flight: Option<usize>) -> Config {
    let mut config = Config::default();
    config.pricing.volatility = VolatilitySource::Fixed(50);
    config.confirmation.max_in_flight = max_in_flight;
    config.households = (1..=5)
        .map(|i| household(i, HouseholdStatus::Active))
        .chain(std::iter::once(household(6, HouseholdStatus::Archived)))
        .collect();
    config
}

async fn memory_node(max_in_flight: Option<usize>) -> (Arc<MemoryStore>, Services) {
    let store = Arc::new(MemoryStore::new());
    let config = config(max_in_flight);
    let services = Services::build(&config, Stores::from_backend(store.clone()));
    services.seed(&config).await.unwrap();
    (store, services)
}

fn reading(meter_id: &str, timestamp: &str) -> MeterReading {
    MeterReading {
        meter_id: meter_id.to_string(),
        timestamp: timestamp.to_string(),
        temperature: 3.0,
        consumption_kwh: 2.1,
    }
}

// =============================================================================
// Dropped readings
// =============================================================================

#[tokio::test]
async fn test_unknown_meter_is_dropped_without_side_effects() {
    let (store, services) = memory_node(None).await;

    let outcome = services
        .gateway
        .ingest(reading("not_registered", "2024-01-15T19:30:00Z"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        IngestOutcome::Dropped {
            reason: DropReason::UnknownMeter,
            ..
        }
    ));
    assert!(store.predictions().await.is_empty());
    assert!(store.log_records().await.is_empty());
    assert_eq!(services.ledger.stats().await.total_transactions, 0);
}

// =============================================================================
// Accepted readings
// =============================================================================

#[tokio::test]
async fn test_winter_evening_reading_is_priced_with_household_context() {
    let (_store, services) = memory_node(None).await;

    let outcome = services
        .gateway
        .ingest(reading("household_1", "2024-01-15T19:30:00Z"))
        .await
        .unwrap();
    let prediction = outcome.prediction().unwrap().clone();

    assert_eq!(prediction.hour, 19);
    assert_eq!(prediction.household_id, "house_001");
    assert!(prediction.confidence < 92);
    assert!((CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&prediction.confidence));

    let ctx = household(1, HouseholdStatus::Active);
    let engine = services.gateway.pricing();
    let expected = engine.predict(
        Some(&ctx),
        &pulse_node::pricing::PriceQuery::new(19, 1, 3.0, 2.1).unwrap(),
    );
    assert_eq!(expected.mode, PricingMode::Household);
    assert_eq!(prediction.predicted_price, expected.price);
}

#[tokio::test]
async fn test_archived_household_readings_are_accepted() {
    let (_store, services) = memory_node(None).await;

    let outcome = services
        .gateway
        .ingest(reading("household_6", "2024-06-01T12:00:00Z"))
        .await
        .unwrap();

    let IngestOutcome::Accepted { confirmation, .. } = outcome else {
        panic!("archived meters still resolve");
    };
    assert!(matches!(
        confirmation.wait().await,
        Confirmation::Confirmed { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readings_build_a_linear_chain() {
    let (store, services) = memory_node(None).await;
    let start = services.ledger.stats().await.current_block_number;

    let tasks = (0..40).map(|i| {
        let gateway = services.gateway.clone();
        tokio::spawn(async move {
            let meter = format!("household_{}", i % 5 + 1);
            gateway
                .ingest(reading(&meter, "2024-01-15T08:00:00Z"))
                .await
                .unwrap()
        })
    });

    let mut confirmations = Vec::new();
    for outcome in join_all(tasks).await {
        match outcome.unwrap() {
            IngestOutcome::Accepted { confirmation, .. } => confirmations.push(confirmation),
            IngestOutcome::Dropped { .. } => panic!("registered meters are never dropped"),
        }
    }
    for confirmation in confirmations {
        assert!(matches!(
            confirmation.wait().await,
            Confirmation::Confirmed { .. }
        ));
    }

    let blocks = services.ledger.snapshot().await;
    assert_eq!(blocks.len(), 41);
    for (offset, block) in blocks.iter().enumerate() {
        assert_eq!(block.number, start + offset as u64);
    }
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
    }
    assert_eq!(services.ledger.audit().await, Ok(()));

    // Confirmation flag set iff the chain carries a transaction for it
    for prediction in store.predictions().await {
        let on_chain = services.ledger.transaction_for(prediction.id).await;
        assert!(prediction.ledger_confirmed);
        assert_eq!(prediction.ledger_tx, on_chain);
    }
}

#[tokio::test]
async fn test_bounded_confirmations_still_confirm_everything() {
    let (store, services) = memory_node(Some(1)).await;

    let mut confirmations = Vec::new();
    for i in 1..=5 {
        let outcome = services
            .gateway
            .ingest(reading(&format!("household_{}", i), "2024-01-15T03:00:00Z"))
            .await
            .unwrap();
        if let IngestOutcome::Accepted { confirmation, .. } = outcome {
            confirmations.push(confirmation);
        }
    }
    for confirmation in confirmations {
        confirmation.wait().await;
    }

    let predictions = store.predictions().await;
    assert_eq!(predictions.len(), 5);
    assert!(predictions.iter().all(|p| p.ledger_confirmed));
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_log_write_failure_leaves_prediction_unconfirmed() {
    let (store, services) = memory_node(None).await;
    store.fail_log_writes(true);

    let outcome = services
        .gateway
        .ingest(reading("household_2", "2024-01-15T19:30:00Z"))
        .await
        .unwrap();
    let IngestOutcome::Accepted {
        prediction,
        confirmation,
        ..
    } = outcome
    else {
        panic!("reading should be stored");
    };

    assert!(matches!(
        confirmation.wait().await,
        Confirmation::Failed { .. }
    ));
    let stored = store.find(prediction.id).await.unwrap().unwrap();
    assert!(!stored.ledger_confirmed);
    assert!(stored.ledger_tx.is_none());

    // The chain itself stays consistent
    assert_eq!(services.ledger.audit().await, Ok(()));
}

#[tokio::test]
async fn test_persistence_failure_never_reaches_the_ledger() {
    let (store, services) = memory_node(None).await;
    store.fail_next_prediction_create();

    let result = services
        .gateway
        .ingest(reading("household_3", "2024-01-15T19:30:00Z"))
        .await;

    assert!(result.is_err());
    assert_eq!(services.ledger.stats().await.total_transactions, 0);
}

// =============================================================================
// SQLite backend
// =============================================================================

#[tokio::test]
async fn test_pipeline_on_sqlite_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path()).unwrap());
    let config = config(None);
    let services = Services::build(&config, Stores::from_backend(store.clone()));
    assert_eq!(services.seed(&config).await.unwrap(), 6);

    let outcome = services
        .gateway
        .ingest(reading("household_4", "garbage"))
        .await
        .unwrap();
    let IngestOutcome::Accepted {
        prediction,
        used_fallback_timestamp,
        confirmation,
    } = outcome
    else {
        panic!("reading should be accepted");
    };
    assert!(used_fallback_timestamp);

    let Confirmation::Confirmed { tx_hash } = confirmation.wait().await else {
        panic!("confirmation should succeed");
    };

    let stored = store.find(prediction.id).await.unwrap().unwrap();
    assert!(stored.ledger_confirmed);
    assert_eq!(stored.ledger_tx.as_deref(), Some(tx_hash.as_str()));

    let view = services.query.verify(&tx_hash).await.unwrap();
    assert!(view.verified);
    assert_eq!(view.prediction.unwrap().meter_id, "household_4");
}
