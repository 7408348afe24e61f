//! Blocks, transactions and the hash functions that chain them

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{Prediction, PredictionId};

/// Previous-hash sentinel carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

pub const BASE_GAS: u64 = 21_000;
pub const GAS_PER_PAYLOAD_BYTE: u64 = 68;

/// A ledger entry logging exactly one prediction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub hash: String,
    pub prediction_id: PredictionId,
    pub block_number: u64,
    pub payload: String,
    pub gas_used: u64,
}

/// An immutable, hash-linked block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub hash: String,
    pub transactions: Vec<LedgerTransaction>,
}

impl Block {
    pub fn genesis(number: u64, created_at: DateTime<Utc>) -> Self {
        Self::seal(number, GENESIS_PREVIOUS_HASH.to_string(), created_at, Vec::new())
    }

    /// Build a block and compute its hash from the header fields
    pub fn seal(
        number: u64,
        previous_hash: String,
        created_at: DateTime<Utc>,
        transactions: Vec<LedgerTransaction>,
    ) -> Self {
        let hash = block_hash(number, &previous_hash, created_at, transactions.len());
        Self {
            number,
            created_at,
            previous_hash,
            hash,
            transactions,
        }
    }

    /// Recompute the hash from the stored fields
    pub fn compute_hash(&self) -> String {
        block_hash(
            self.number,
            &self.previous_hash,
            self.created_at,
            self.transactions.len(),
        )
    }
}

/// Digest over `number|previous_hash|created_at|tx_count`
pub fn block_hash(
    number: u64,
    previous_hash: &str,
    created_at: DateTime<Utc>,
    tx_count: usize,
) -> String {
    digest(&format!(
        "{}|{}|{}|{}",
        number,
        previous_hash,
        created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        tx_count
    ))
}

/// Deterministic payload recorded for a prediction
pub fn transaction_payload(prediction: &Prediction) -> String {
    format!(
        "PREDICTION|{}|{}|{:.4}|{}|{}",
        prediction.id,
        prediction.meter_id,
        prediction.predicted_price,
        prediction.confidence,
        prediction
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Content-addressed transaction hash; the nonce keeps repeated payloads distinct
pub fn transaction_hash(payload: &str, prediction_id: PredictionId, nonce: i128) -> String {
    digest(&format!("{}|{}|{}", payload, prediction_id, nonce))
}

pub fn gas_for(payload: &str) -> u64 {
    BASE_GAS + GAS_PER_PAYLOAD_BYTE * payload.len() as u64
}

fn digest(input: &str) -> String {
    format!("0x{}", hex::encode(Sha256::digest(input.as_bytes())))
}

/// First broken invariant found while walking a chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainViolation {
    #[error("chain is empty")]
    Empty,

    #[error("genesis block {number} does not carry the sentinel previous hash")]
    BadGenesis { number: u64 },

    #[error("block numbering broken: expected {expected}, found {found}")]
    NumberGap { expected: u64, found: u64 },

    #[error("block {number} does not link to the hash of its predecessor")]
    BrokenLink { number: u64 },

    #[error("block {number} hash does not match its contents")]
    HashMismatch { number: u64 },

    #[error("transaction {hash} in block {number} records the wrong block number")]
    MisplacedTransaction { number: u64, hash: String },
}

/// Check numbering, linkage and hashes across a whole chain
pub fn audit_blocks(blocks: &[Block]) -> Result<(), ChainViolation> {
    let genesis = blocks.first().ok_or(ChainViolation::Empty)?;
    if genesis.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err(ChainViolation::BadGenesis {
            number: genesis.number,
        });
    }

    let mut previous: Option<&Block> = None;
    for block in blocks {
        if let Some(prev) = previous {
            if block.number != prev.number + 1 {
                return Err(ChainViolation::NumberGap {
                    expected: prev.number + 1,
                    found: block.number,
                });
            }
            if block.previous_hash != prev.hash {
                return Err(ChainViolation::BrokenLink {
                    number: block.number,
                });
            }
        }

        if block.compute_hash() != block.hash {
            return Err(ChainViolation::HashMismatch {
                number: block.number,
            });
        }

        if let Some(tx) = block
            .transactions
            .iter()
            .find(|tx| tx.block_number != block.number)
        {
            return Err(ChainViolation::MisplacedTransaction {
                number: block.number,
                hash: tx.hash.clone(),
            });
        }

        previous = Some(block);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prediction() -> Prediction {
        crate::models::NewPrediction {
            user_id: 1,
            household_id: "house_001".to_string(),
            meter_id: "m1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 19, 30, 0).unwrap(),
            hour: 19,
            temperature: 3.0,
            consumption_kwh: 2.1,
            predicted_price: 0.25,
            confidence: 88,
            actual_price: None,
        }
        .with_id(42)
    }

    #[test]
    fn test_payload_format() {
        assert_eq!(
            transaction_payload(&prediction()),
            "PREDICTION|42|m1|0.2500|88|2024-01-15T19:30:00Z"
        );
    }

    #[test]
    fn test_hashes_are_prefixed_sha256_hex() {
        let hash = transaction_hash("payload", 1, 7);
        assert!(hash.starts_with("0x"));
        assert_eq!(hash.len(), 66);
        assert_ne!(hash, transaction_hash("payload", 1, 8));
    }

    #[test]
    fn test_gas_grows_with_payload() {
        assert_eq!(gas_for(""), 21_000);
        assert_eq!(gas_for("abcd"), 21_272);
    }

    #[test]
    fn test_audit_detects_tampering() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let genesis = Block::genesis(100, t0);
        let next = Block::seal(101, genesis.hash.clone(), t0, Vec::new());
        let mut chain = vec![genesis, next];
        assert_eq!(audit_blocks(&chain), Ok(()));

        chain[1].created_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(
            audit_blocks(&chain),
            Err(ChainViolation::HashMismatch { number: 101 })
        );

        chain[1].hash = chain[1].compute_hash();
        chain[0].hash = "0xdead".to_string();
        assert_eq!(
            audit_blocks(&chain),
            Err(ChainViolation::HashMismatch { number: 100 })
        );
        assert_eq!(audit_blocks(&[]), Err(ChainViolation::Empty));
    }
}
