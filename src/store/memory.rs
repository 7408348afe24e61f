//! In-memory record store for tests and `--ephemeral` runs
//!
//! Supports simple fault injection so pipeline failure paths can be
//! exercised without a broken database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{HouseholdStore, LedgerLogStore, PredictionAggregate, PredictionStore, StoreError};
use crate::models::{
    HouseholdContext, LedgerLogRecord, NewPrediction, Prediction, PredictionFilter, PredictionId,
    UserId,
};

#[derive(Default)]
struct PredictionTable {
    next_id: PredictionId,
    rows: HashMap<PredictionId, Prediction>,
}

#[derive(Default)]
pub struct MemoryStore {
    households: RwLock<HashMap<String, HouseholdContext>>,
    predictions: RwLock<PredictionTable>,
    logs: RwLock<Vec<LedgerLogRecord>>,
    fail_next_create: AtomicBool,
    fail_logs: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail with a backend error
    pub fn fail_next_prediction_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Make every ledger log write fail until switched off
    pub fn fail_log_writes(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every stored prediction ordered by id
    pub async fn predictions(&self) -> Vec<Prediction> {
        let table = self.predictions.read().await;
        let mut rows: Vec<_> = table.rows.values().cloned().collect();
        rows.sort_by_key(|p| p.id);
        rows
    }

    pub async fn log_records(&self) -> Vec<LedgerLogRecord> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl HouseholdStore for MemoryStore {
    async fn find_by_meter(&self, meter_id: &str) -> Result<Option<HouseholdContext>, StoreError> {
        let households = self.households.read().await;
        Ok(households.values().find(|h| h.meter_id == meter_id).cloned())
    }

    async fn upsert(&self, household: HouseholdContext) -> Result<(), StoreError> {
        let mut households = self.households.write().await;
        let taken = households
            .values()
            .any(|h| h.meter_id == household.meter_id && h.id != household.id);
        if taken {
            return Err(StoreError::Constraint(format!(
                "meter {} already belongs to another household",
                household.meter_id
            )));
        }
        households.insert(household.id.clone(), household);
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn create(&self, prediction: NewPrediction) -> Result<Prediction, StoreError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected create failure".to_string()));
        }

        let mut table = self.predictions.write().await;
        table.next_id += 1;
        let stored = prediction.with_id(table.next_id);
        table.rows.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_confirmation(
        &self,
        id: PredictionId,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        let mut table = self.predictions.write().await;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("prediction", id))?;

        if row.ledger_confirmed {
            return Err(StoreError::Constraint(format!(
                "prediction {} is already confirmed",
                id
            )));
        }
        row.ledger_confirmed = true;
        row.ledger_tx = Some(tx_hash.to_string());
        Ok(())
    }

    async fn find(&self, id: PredictionId) -> Result<Option<Prediction>, StoreError> {
        Ok(self.predictions.read().await.rows.get(&id).cloned())
    }

    async fn find_many(
        &self,
        filter: &PredictionFilter,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Prediction>, StoreError> {
        let table = self.predictions.read().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        Ok(rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, filter: &PredictionFilter) -> Result<u64, StoreError> {
        let table = self.predictions.read().await;
        Ok(table.rows.values().filter(|p| filter.matches(p)).count() as u64)
    }

    async fn aggregate(&self, filter: &PredictionFilter) -> Result<PredictionAggregate, StoreError> {
        let table = self.predictions.read().await;
        let matching: Vec<&Prediction> = table.rows.values().filter(|p| filter.matches(p)).collect();
        if matching.is_empty() {
            return Ok(PredictionAggregate::default());
        }

        let n = matching.len() as f64;
        Ok(PredictionAggregate {
            average_price: Some(matching.iter().map(|p| p.predicted_price).sum::<f64>() / n),
            average_consumption: Some(matching.iter().map(|p| p.consumption_kwh).sum::<f64>() / n),
            last_timestamp: matching.iter().map(|p| p.timestamp).max(),
        })
    }
}

#[async_trait]
impl LedgerLogStore for MemoryStore {
    async fn record(&self, record: LedgerLogRecord) -> Result<(), StoreError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected log write failure".to_string()));
        }

        let mut logs = self.logs.write().await;
        let duplicate = logs.iter().any(|r| {
            r.transaction_hash == record.transaction_hash || r.prediction_id == record.prediction_id
        });
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "log record for {} already exists",
                record.transaction_hash
            )));
        }
        logs.push(record);
        Ok(())
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<LedgerLogRecord>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|r| r.transaction_hash == tx_hash).cloned())
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<LedgerLogRecord>, StoreError> {
        let owned: Vec<PredictionId> = {
            let table = self.predictions.read().await;
            table
                .rows
                .values()
                .filter(|p| p.user_id == user_id)
                .map(|p| p.id)
                .collect()
        };

        let logs = self.logs.read().await;
        let mut records: Vec<_> = logs
            .iter()
            .filter(|r| owned.contains(&r.prediction_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.logged_at
                .cmp(&a.logged_at)
                .then(b.block_number.cmp(&a.block_number))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn new_prediction(user_id: UserId, price: f64) -> NewPrediction {
        NewPrediction {
            user_id,
            household_id: "house_001".to_string(),
            meter_id: "household_1".to_string(),
            timestamp: Utc::now(),
            hour: 3,
            temperature: 8.0,
            consumption_kwh: 0.6,
            predicted_price: price,
            confidence: 90,
            actual_price: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_assigned_sequentially() {
        let store = MemoryStore::new();
        let a = store.create(new_prediction(1, 0.1)).await.unwrap();
        let b = store.create(new_prediction(1, 0.2)).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.predictions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_create_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_prediction_create();
        assert!(matches!(
            store.create(new_prediction(1, 0.1)).await,
            Err(StoreError::Backend(_))
        ));
        assert!(store.create(new_prediction(1, 0.1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirmation_happens_once() {
        let store = MemoryStore::new();
        let p = store.create(new_prediction(1, 0.1)).await.unwrap();
        store.update_confirmation(p.id, "0x1").await.unwrap();
        assert!(matches!(
            store.update_confirmation(p.id, "0x2").await,
            Err(StoreError::Constraint(_))
        ));
        assert_eq!(
            store.find(p.id).await.unwrap().unwrap().ledger_tx.as_deref(),
            Some("0x1")
        );
    }

    #[tokio::test]
    async fn test_aggregate_over_empty_and_filled_sets() {
        let store = MemoryStore::new();
        assert_eq!(
            store.aggregate(&PredictionFilter::default()).await.unwrap(),
            PredictionAggregate::default()
        );
        store.create(new_prediction(1, 0.1)).await.unwrap();
        store.create(new_prediction(2, 0.3)).await.unwrap();

        let aggregate = store.aggregate(&PredictionFilter::default()).await.unwrap();
        assert!((aggregate.average_price.unwrap() - 0.2).abs() < 1e-12);
        assert!((aggregate.average_consumption.unwrap() - 0.6).abs() < 1e-12);
        assert!(aggregate.last_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_find_many_orders_newest_first_and_pages() {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        for day in 0..5 {
            let mut p = new_prediction(1, 0.1);
            p.timestamp = start + Duration::days(day);
            store.create(p).await.unwrap();
        }
        store.create(new_prediction(2, 0.1)).await.unwrap();

        let filter = PredictionFilter::for_user(1);
        let first = store.find_many(&filter, 2, 0).await.unwrap();
        assert_eq!(
            first.iter().map(|p| p.timestamp).collect::<Vec<_>>(),
            vec![start + Duration::days(4), start + Duration::days(3)]
        );
        assert_eq!(store.find_many(&filter, 2, 4).await.unwrap().len(), 1);
        assert!(store.find_many(&filter, 2, 10).await.unwrap().is_empty());

        let window = filter.between(Some(start + Duration::days(1)), Some(start + Duration::days(3)));
        assert_eq!(store.find_many(&window, 20, 0).await.unwrap().len(), 2);
        assert_eq!(store.count(&window).await.unwrap(), 2);
    }
}
