//! Read-only query surface over the ledger and the record stores
//!
//! Views serialize with camelCase names and are what the HTTP layer returns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{LedgerError, LedgerService, LedgerStats};
use crate::models::{
    LedgerLogRecord, LogStatus, Prediction, PredictionFilter, PredictionId, UserId,
};
use crate::store::{LedgerLogStore, PredictionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for QueryError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::TransactionNotFound(hash) => {
                QueryError::NotFound(format!("transaction {}", hash))
            }
            LedgerError::BlockNotFound(number) => QueryError::NotFound(format!("block {}", number)),
            LedgerError::Store(e) => QueryError::Store(e),
            other => QueryError::Ledger(other),
        }
    }
}

/// Prediction fields shown next to ledger records
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionSummary {
    pub id: PredictionId,
    pub meter_id: String,
    pub household_id: String,
    pub predicted_price: f64,
    pub actual_price: Option<f64>,
    pub confidence: u8,
    pub timestamp: DateTime<Utc>,
}

impl From<&Prediction> for PredictionSummary {
    fn from(p: &Prediction) -> Self {
        Self {
            id: p.id,
            meter_id: p.meter_id.clone(),
            household_id: p.household_id.clone(),
            predicted_price: p.predicted_price,
            actual_price: p.actual_price,
            confidence: p.confidence,
            timestamp: p.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationView {
    pub verified: bool,
    pub transaction_hash: String,
    pub block_number: u64,
    pub status: LogStatus,
    pub gas_used: u64,
    pub contract_address: String,
    pub logged_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// The transaction is present in the in-memory chain
    pub on_chain: bool,
    pub prediction: Option<PredictionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTransactionView {
    pub hash: String,
    pub prediction_id: PredictionId,
    pub gas_used: u64,
    pub payload: String,
    pub meter_id: Option<String>,
    pub predicted_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub hash: String,
    pub previous_hash: String,
    pub transactions: Vec<BlockTransactionView>,
    pub tx_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogView {
    #[serde(flatten)]
    pub record: LedgerLogRecord,
    pub prediction: Option<PredictionSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLedgerSummary {
    pub transactions: u64,
    pub confirmed: u64,
    pub pending: u64,
    pub total_gas: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionStatistics {
    pub total: u64,
    pub confirmed: u64,
    pub average_price: Option<f64>,
    pub average_consumption: Option<f64>,
    pub last_prediction_at: Option<DateTime<Utc>>,
}

/// One page of predictions, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPage {
    pub predictions: Vec<Prediction>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

#[derive(Clone)]
pub struct LedgerQuery {
    ledger: Arc<LedgerService>,
    predictions: Arc<dyn PredictionStore>,
    logs: Arc<dyn LedgerLogStore>,
}

impl LedgerQuery {
    pub fn new(
        ledger: Arc<LedgerService>,
        predictions: Arc<dyn PredictionStore>,
        logs: Arc<dyn LedgerLogStore>,
    ) -> Self {
        Self {
            ledger,
            predictions,
            logs,
        }
    }

    pub async fn stats(&self) -> LedgerStats {
        self.ledger.stats().await
    }

    pub async fn verify(&self, tx_hash: &str) -> Result<VerificationView, QueryError> {
        let verification = self.ledger.verify(tx_hash).await?;
        let record = verification.record;
        let on_chain = self.ledger.get_transaction(tx_hash).await.is_ok();
        let prediction = self.predictions.find(record.prediction_id).await?;

        Ok(VerificationView {
            verified: verification.verified,
            transaction_hash: record.transaction_hash,
            block_number: record.block_number,
            status: record.status,
            gas_used: record.gas_used,
            contract_address: record.contract_address,
            logged_at: record.logged_at,
            confirmed_at: record.confirmed_at,
            on_chain,
            prediction: prediction.as_ref().map(PredictionSummary::from),
        })
    }

    pub async fn block(&self, number: u64) -> Result<BlockView, QueryError> {
        let block = self.ledger.get_block(number).await?;

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in block.transactions {
            let prediction = self.predictions.find(tx.prediction_id).await?;
            transactions.push(BlockTransactionView {
                hash: tx.hash,
                prediction_id: tx.prediction_id,
                gas_used: tx.gas_used,
                payload: tx.payload,
                meter_id: prediction.as_ref().map(|p| p.meter_id.clone()),
                predicted_price: prediction.as_ref().map(|p| p.predicted_price),
            });
        }

        Ok(BlockView {
            block_number: block.number,
            timestamp: block.created_at,
            hash: block.hash,
            previous_hash: block.previous_hash,
            tx_count: transactions.len(),
            transactions,
        })
    }

    /// Log records of every prediction a user owns, newest first
    pub async fn logs_for_user(&self, user_id: UserId) -> Result<Vec<LogView>, QueryError> {
        let records = self.logs.find_by_user(user_id).await?;

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let prediction = self.predictions.find(record.prediction_id).await?;
            views.push(LogView {
                record,
                prediction: prediction.as_ref().map(PredictionSummary::from),
            });
        }
        Ok(views)
    }

    pub async fn user_summary(&self, user_id: UserId) -> Result<UserLedgerSummary, QueryError> {
        let records = self.logs.find_by_user(user_id).await?;

        Ok(records
            .iter()
            .fold(UserLedgerSummary::default(), |mut summary, record| {
                summary.transactions += 1;
                if record.status == LogStatus::Confirmed {
                    summary.confirmed += 1;
                } else {
                    summary.pending += 1;
                }
                summary.total_gas += record.gas_used;
                summary
            }))
    }

    pub async fn prediction(&self, id: PredictionId) -> Result<Prediction, QueryError> {
        self.predictions
            .find(id)
            .await?
            .ok_or_else(|| QueryError::NotFound(format!("prediction {}", id)))
    }

    pub async fn statistics(
        &self,
        filter: PredictionFilter,
    ) -> Result<PredictionStatistics, QueryError> {
        let total = self.predictions.count(&filter).await?;
        let confirmed = self.predictions.count(&filter.clone().confirmed(true)).await?;
        let aggregate = self.predictions.aggregate(&filter).await?;

        Ok(PredictionStatistics {
            total,
            confirmed,
            average_price: aggregate.average_price,
            average_consumption: aggregate.average_consumption,
            last_prediction_at: aggregate.last_timestamp,
        })
    }

    /// Page through matching predictions. `page` starts at 1 and `limit`
    /// must be positive.
    pub async fn predictions(
        &self,
        filter: &PredictionFilter,
        page: u32,
        limit: u32,
    ) -> Result<PredictionPage, QueryError> {
        let offset = u64::from(page.saturating_sub(1)) * u64::from(limit);
        let total = self.predictions.count(filter).await?;
        let predictions = self.predictions.find_many(filter, limit, offset).await?;

        Ok(PredictionPage {
            predictions,
            total,
            page,
            limit,
            total_pages: total.div_ceil(u64::from(limit.max(1))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::models::NewPrediction;
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Arc<LedgerService>, LedgerQuery) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(LedgerService::new(LedgerConfig::default(), store.clone()));
        let query = LedgerQuery::new(ledger.clone(), store.clone(), store.clone());
        (store, ledger, query)
    }

    async fn stored_prediction(store: &MemoryStore, user_id: UserId) -> Prediction {
        store
            .create(NewPrediction {
                user_id,
                household_id: "house_001".to_string(),
                meter_id: "m1".to_string(),
                timestamp: Utc::now(),
                hour: 20,
                temperature: 4.0,
                consumption_kwh: 2.0,
                predicted_price: 0.2,
                confidence: 89,
                actual_price: Some(0.21),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_includes_prediction_summary() {
        let (store, ledger, query) = setup().await;
        let prediction = stored_prediction(&store, 1).await;
        let tx_hash = ledger.append(&prediction).await.unwrap();

        let view = query.verify(&tx_hash).await.unwrap();
        assert!(view.verified);
        assert!(view.on_chain);
        assert_eq!(view.prediction.unwrap().id, prediction.id);

        let json = serde_json::to_value(query.verify(&tx_hash).await.unwrap()).unwrap();
        assert_eq!(json["transactionHash"], tx_hash.as_str());
        assert_eq!(json["status"], "confirmed");
    }

    #[tokio::test]
    async fn test_unknown_lookups_are_not_found() {
        let (_store, _ledger, query) = setup().await;
        assert!(matches!(
            query.verify("0xnothing").await,
            Err(QueryError::NotFound(_))
        ));
        assert!(matches!(query.block(1).await, Err(QueryError::NotFound(_))));
        assert!(matches!(
            query.prediction(9).await,
            Err(QueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_summary_and_logs() {
        let (store, ledger, query) = setup().await;
        for _ in 0..3 {
            let p = stored_prediction(&store, 1).await;
            ledger.append(&p).await.unwrap();
        }
        let other = stored_prediction(&store, 2).await;
        ledger.append(&other).await.unwrap();

        let summary = query.user_summary(1).await.unwrap();
        assert_eq!(summary.transactions, 3);
        assert_eq!(summary.confirmed, 3);
        assert_eq!(summary.pending, 0);
        assert!(summary.total_gas > 3 * 21_000);

        let logs = query.logs_for_user(1).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs
            .windows(2)
            .all(|w| w[0].record.logged_at >= w[1].record.logged_at));
    }

    #[tokio::test]
    async fn test_block_view_and_statistics() {
        let (store, ledger, query) = setup().await;
        let prediction = stored_prediction(&store, 1).await;
        ledger.append(&prediction).await.unwrap();

        let number = ledger.stats().await.current_block_number;
        let view = query.block(number).await.unwrap();
        assert_eq!(view.tx_count, 1);
        assert_eq!(view.transactions[0].meter_id.as_deref(), Some("m1"));

        let stats = query.statistics(PredictionFilter::default()).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.confirmed, 0);
        assert_eq!(stats.average_price, Some(0.2));
        assert_eq!(stats.average_consumption, Some(2.0));
        assert_eq!(stats.last_prediction_at, Some(prediction.timestamp));
    }

    #[tokio::test]
    async fn test_prediction_pages() {
        let (store, _ledger, query) = setup().await;
        for _ in 0..5 {
            stored_prediction(&store, 1).await;
        }
        stored_prediction(&store, 2).await;

        let filter = PredictionFilter::for_user(1);
        let first = query.predictions(&filter, 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.predictions.len(), 2);

        let last = query.predictions(&filter, 3, 2).await.unwrap();
        assert_eq!(last.predictions.len(), 1);
        assert!(query
            .predictions(&filter, 4, 2)
            .await
            .unwrap()
            .predictions
            .is_empty());
    }
}
