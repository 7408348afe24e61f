//! Ledger service - single hash-chained, append-only chain of prediction blocks
//!
//! The chain lives in memory behind one `RwLock`. The write guard is the
//! append critical section: read tip, build the block, advance the tip.
//! Reads take the shared guard. The durable log record is written after the
//! guard is released, so a failed log write leaves the tip advanced.
//!
//! ```text
//! genesis(N) <- block(N+1, tx) <- block(N+2, tx) <- ...
//! ```

pub mod block;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::models::{LedgerLogRecord, LogStatus, Prediction, PredictionId};
use crate::store::{LedgerLogStore, StoreError};

pub use block::{
    audit_blocks, Block, ChainViolation, LedgerTransaction, GENESIS_PREVIOUS_HASH,
};

/// Ledger section of the node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Number given to the genesis block
    #[serde(default = "default_genesis_block_number")]
    pub genesis_block_number: u64,

    /// Address reported in stats and log records
    #[serde(default = "default_contract_address")]
    pub contract_address: String,

    /// Network label reported in stats
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_genesis_block_number() -> u64 { 15_000_000 }
fn default_contract_address() -> String { "0x742d35Cc6634C0532925a3b844Bc9e7595f4e2E1".to_string() }
fn default_network() -> String { "simulated".to_string() }

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            genesis_block_number: default_genesis_block_number(),
            contract_address: default_contract_address(),
            network: default_network(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("prediction {0} is already on the ledger")]
    AlreadyLogged(PredictionId),

    #[error("log record write failed for {tx_hash}: {source}")]
    LogWrite {
        tx_hash: String,
        #[source]
        source: StoreError,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(u64),

    #[error("ledger log lookup failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub current_block_number: u64,
    pub total_blocks: usize,
    pub total_transactions: usize,
    pub contract_address: String,
    pub network: String,
}

/// Result of checking a transaction hash against the log records
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub verified: bool,
    pub record: LedgerLogRecord,
}

struct Chain {
    blocks: Vec<Block>,
    /// tx hash -> index into `blocks`
    tx_index: HashMap<String, usize>,
    by_prediction: HashMap<PredictionId, String>,
}

impl Chain {
    fn new(genesis: Block) -> Self {
        Self {
            blocks: vec![genesis],
            tx_index: HashMap::new(),
            by_prediction: HashMap::new(),
        }
    }

    fn tip(&self) -> &Block {
        // Never empty: constructed with a genesis block, only ever pushed to
        &self.blocks[self.blocks.len() - 1]
    }

    fn push(&mut self, block: Block) {
        let index = self.blocks.len();
        for tx in &block.transactions {
            self.tx_index.insert(tx.hash.clone(), index);
            self.by_prediction.insert(tx.prediction_id, tx.hash.clone());
        }
        self.blocks.push(block);
    }

    fn transaction(&self, tx_hash: &str) -> Option<&LedgerTransaction> {
        let index = *self.tx_index.get(tx_hash)?;
        self.blocks[index]
            .transactions
            .iter()
            .find(|tx| tx.hash == tx_hash)
    }
}

/// Owned ledger handle, constructed once and shared via `Arc`
pub struct LedgerService {
    config: LedgerConfig,
    chain: RwLock<Chain>,
    logs: Arc<dyn LedgerLogStore>,
}

impl LedgerService {
    /// Start a fresh chain with a genesis block stamped now
    pub fn new(config: LedgerConfig, logs: Arc<dyn LedgerLogStore>) -> Self {
        let genesis = Block::genesis(config.genesis_block_number, Utc::now());
        info!(
            block_number = genesis.number,
            network = %config.network,
            "Ledger initialized"
        );

        Self {
            config,
            chain: RwLock::new(Chain::new(genesis)),
            logs,
        }
    }

    /// Log a prediction in a new block and return the transaction hash.
    ///
    /// A prediction can be logged once; a second append is rejected before
    /// the chain is touched.
    pub async fn append(&self, prediction: &Prediction) -> Result<String, LedgerError> {
        let (tx, logged_at) = {
            let mut chain = self.chain.write().await;

            if chain.by_prediction.contains_key(&prediction.id) {
                return Err(LedgerError::AlreadyLogged(prediction.id));
            }

            let tip = chain.tip();
            let number = tip.number + 1;
            let previous_hash = tip.hash.clone();
            let created_at = Utc::now();

            let payload = block::transaction_payload(prediction);
            let tx = LedgerTransaction {
                hash: block::transaction_hash(
                    &payload,
                    prediction.id,
                    nonce(created_at, number),
                ),
                prediction_id: prediction.id,
                block_number: number,
                gas_used: block::gas_for(&payload),
                payload,
            };

            chain.push(Block::seal(number, previous_hash, created_at, vec![tx.clone()]));
            (tx, created_at)
        };

        debug!(
            prediction_id = prediction.id,
            block_number = tx.block_number,
            tx_hash = %tx.hash,
            "Block appended"
        );

        let record = LedgerLogRecord {
            prediction_id: prediction.id,
            transaction_hash: tx.hash.clone(),
            block_number: tx.block_number,
            gas_used: tx.gas_used,
            status: LogStatus::Confirmed,
            contract_address: self.config.contract_address.clone(),
            logged_at,
            confirmed_at: Some(Utc::now()),
        };

        if let Err(e) = self.logs.record(record).await {
            error!(
                prediction_id = prediction.id,
                tx_hash = %tx.hash,
                error = %e,
                "Ledger log write failed after block append"
            );
            return Err(LedgerError::LogWrite {
                tx_hash: tx.hash,
                source: e,
            });
        }

        Ok(tx.hash)
    }

    pub async fn get_transaction(&self, tx_hash: &str) -> Result<LedgerTransaction, LedgerError> {
        let chain = self.chain.read().await;
        chain
            .transaction(tx_hash)
            .cloned()
            .ok_or_else(|| LedgerError::TransactionNotFound(tx_hash.to_string()))
    }

    /// Transaction hash logged for a prediction, if any
    pub async fn transaction_for(&self, prediction_id: PredictionId) -> Option<String> {
        self.chain
            .read()
            .await
            .by_prediction
            .get(&prediction_id)
            .cloned()
    }

    /// Check a transaction hash against its append-time log record
    pub async fn verify(&self, tx_hash: &str) -> Result<Verification, LedgerError> {
        let record = self
            .logs
            .find_by_tx_hash(tx_hash)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(tx_hash.to_string()))?;

        Ok(Verification {
            verified: record.status == LogStatus::Confirmed,
            record,
        })
    }

    pub async fn get_block(&self, number: u64) -> Result<Block, LedgerError> {
        let chain = self.chain.read().await;
        number
            .checked_sub(self.config.genesis_block_number)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|index| chain.blocks.get(index))
            .cloned()
            .ok_or(LedgerError::BlockNotFound(number))
    }

    pub async fn stats(&self) -> LedgerStats {
        let chain = self.chain.read().await;
        LedgerStats {
            current_block_number: chain.tip().number,
            total_blocks: chain.blocks.len(),
            total_transactions: chain.tx_index.len(),
            contract_address: self.config.contract_address.clone(),
            network: self.config.network.clone(),
        }
    }

    /// Walk the whole chain and report the first broken invariant
    pub async fn audit(&self) -> Result<(), ChainViolation> {
        let chain = self.chain.read().await;
        audit_blocks(&chain.blocks)
    }

    /// Copy of every block, genesis first
    pub async fn snapshot(&self) -> Vec<Block> {
        self.chain.read().await.blocks.clone()
    }
}

/// Append time in nanoseconds plus the block number, unique per append
fn nonce(created_at: DateTime<Utc>, block_number: u64) -> i128 {
    let nanos = created_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| created_at.timestamp_micros().saturating_mul(1_000));
    i128::from(nanos) + i128::from(block_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewPrediction;
    use crate::store::MemoryStore;

    fn prediction(id: PredictionId) -> Prediction {
        NewPrediction {
            user_id: 1,
            household_id: "house_001".to_string(),
            meter_id: "m1".to_string(),
            timestamp: Utc::now(),
            hour: 12,
            temperature: 20.0,
            consumption_kwh: 1.0,
            predicted_price: 0.1,
            confidence: 90,
            actual_price: None,
        }
        .with_id(id)
    }

    fn ledger(store: Arc<MemoryStore>) -> LedgerService {
        LedgerService::new(
            LedgerConfig {
                genesis_block_number: 100,
                ..LedgerConfig::default()
            },
            store,
        )
    }

    #[tokio::test]
    async fn test_genesis_only_stats() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let stats = ledger.stats().await;
        assert_eq!(stats.current_block_number, 100);
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.total_transactions, 0);
        assert_eq!(stats.network, "simulated");

        let genesis = ledger.get_block(100).await.unwrap();
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(matches!(
            ledger.get_block(99).await,
            Err(LedgerError::BlockNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_append_links_to_tip() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let tip = ledger.get_block(100).await.unwrap();

        let tx_hash = ledger.append(&prediction(1)).await.unwrap();
        let block = ledger.get_block(101).await.unwrap();
        assert_eq!(block.previous_hash, tip.hash);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].hash, tx_hash);

        let tx = ledger.get_transaction(&tx_hash).await.unwrap();
        assert_eq!(tx.prediction_id, 1);
        assert_eq!(tx.gas_used, block::gas_for(&tx.payload));
        assert_eq!(ledger.transaction_for(1).await, Some(tx_hash));
    }

    #[tokio::test]
    async fn test_second_append_of_same_prediction_is_rejected() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        ledger.append(&prediction(7)).await.unwrap();
        assert!(matches!(
            ledger.append(&prediction(7)).await,
            Err(LedgerError::AlreadyLogged(7))
        ));
        assert_eq!(ledger.stats().await.total_blocks, 2);
    }

    #[tokio::test]
    async fn test_failed_log_write_keeps_advanced_tip() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        store.fail_log_writes(true);

        let err = ledger.append(&prediction(1)).await.unwrap_err();
        let tx_hash = match err {
            LedgerError::LogWrite { tx_hash, .. } => tx_hash,
            other => panic!("unexpected error: {other}"),
        };

        assert_eq!(ledger.stats().await.current_block_number, 101);
        assert!(ledger.get_transaction(&tx_hash).await.is_ok());
        assert!(matches!(
            ledger.verify(&tx_hash).await,
            Err(LedgerError::TransactionNotFound(_))
        ));
        assert_eq!(ledger.audit().await, Ok(()));
    }

    #[tokio::test]
    async fn test_verify_reads_log_record() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let tx_hash = ledger.append(&prediction(3)).await.unwrap();

        let verification = ledger.verify(&tx_hash).await.unwrap();
        assert!(verification.verified);
        assert_eq!(verification.record.block_number, 101);
        assert_eq!(
            verification.record.contract_address,
            LedgerConfig::default().contract_address
        );
    }
}
