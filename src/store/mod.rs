//! Record stores - persistence collaborator contracts
//!
//! The pipeline only depends on these traits:
//! - [`HouseholdStore`]: meter id -> household lookups
//! - [`PredictionStore`]: create / update / find / count of predictions
//! - [`LedgerLogStore`]: append-time ledger log records
//!
//! Backends: [`SqliteStore`] for the node, [`MemoryStore`] for tests and
//! ephemeral runs.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    HouseholdContext, LedgerLogRecord, NewPrediction, Prediction, PredictionFilter, PredictionId,
    UserId,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.unwrap_or_else(|| err.to_string()))
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
pub trait HouseholdStore: Send + Sync {
    async fn find_by_meter(&self, meter_id: &str) -> Result<Option<HouseholdContext>, StoreError>;

    /// Insert or replace the household registered under its id
    async fn upsert(&self, household: HouseholdContext) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Persist a new, unconfirmed prediction and return it with its id
    async fn create(&self, prediction: NewPrediction) -> Result<Prediction, StoreError>;

    /// Mark a prediction as confirmed on the ledger.
    ///
    /// A prediction is confirmed at most once; a second call is a
    /// constraint violation.
    async fn update_confirmation(
        &self,
        id: PredictionId,
        tx_hash: &str,
    ) -> Result<(), StoreError>;

    async fn find(&self, id: PredictionId) -> Result<Option<Prediction>, StoreError>;

    /// Predictions matching `filter`, newest event timestamp first
    async fn find_many(
        &self,
        filter: &PredictionFilter,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Prediction>, StoreError>;

    async fn count(&self, filter: &PredictionFilter) -> Result<u64, StoreError>;

    async fn aggregate(&self, filter: &PredictionFilter) -> Result<PredictionAggregate, StoreError>;
}

/// Averages and latest event time over a filtered set of predictions.
/// All fields are `None` when nothing matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionAggregate {
    pub average_price: Option<f64>,
    pub average_consumption: Option<f64>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait LedgerLogStore: Send + Sync {
    /// Write a log record; duplicate transaction hashes or predictions are
    /// constraint violations
    async fn record(&self, record: LedgerLogRecord) -> Result<(), StoreError>;

    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<LedgerLogRecord>, StoreError>;

    /// Records for all predictions owned by a user, newest first
    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<LedgerLogRecord>, StoreError>;
}

/// The three store handles, usually backed by one object
#[derive(Clone)]
pub struct Stores {
    pub households: Arc<dyn HouseholdStore>,
    pub predictions: Arc<dyn PredictionStore>,
    pub ledger_logs: Arc<dyn LedgerLogStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: HouseholdStore + PredictionStore + LedgerLogStore + 'static,
    {
        Self {
            households: backend.clone(),
            predictions: backend.clone(),
            ledger_logs: backend,
        }
    }
}
