//! SQLite-backed record store
//!
//! One connection in WAL mode behind an async mutex. Timestamps are stored as
//! fixed-width UTC RFC3339 text so they order lexically, enums as their
//! snake_case names.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{HouseholdStore, LedgerLogStore, PredictionAggregate, PredictionStore, StoreError};
use crate::models::{
    HouseholdContext, LedgerLogRecord, NewPrediction, Prediction, PredictionFilter, PredictionId,
    UserId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS households (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    meter_id TEXT NOT NULL UNIQUE,
    region TEXT NOT NULL,
    city TEXT NOT NULL,
    members INTEGER NOT NULL,
    area_sqm REAL NOT NULL,
    year_built INTEGER NOT NULL,
    heating_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    household_id TEXT NOT NULL,
    meter_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    hour INTEGER NOT NULL,
    temperature REAL NOT NULL,
    consumption_kwh REAL NOT NULL,
    predicted_price REAL NOT NULL,
    confidence INTEGER NOT NULL,
    actual_price REAL,
    ledger_confirmed INTEGER NOT NULL DEFAULT 0,
    ledger_tx TEXT
);
CREATE INDEX IF NOT EXISTS idx_predictions_user ON predictions(user_id);
CREATE INDEX IF NOT EXISTS idx_predictions_meter ON predictions(meter_id);

CREATE TABLE IF NOT EXISTS ledger_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prediction_id INTEGER NOT NULL UNIQUE,
    transaction_hash TEXT NOT NULL UNIQUE,
    block_number INTEGER NOT NULL,
    gas_used INTEGER NOT NULL,
    status TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    logged_at TEXT NOT NULL,
    confirmed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_ledger_log_block ON ledger_log(block_number);
";

const PREDICTION_COLUMNS: &str = "id, user_id, household_id, meter_id, timestamp, hour, \
     temperature, consumption_kwh, predicted_price, confidence, actual_price, \
     ledger_confirmed, ledger_tx";

const LOG_COLUMNS: &str = "l.prediction_id, l.transaction_hash, l.block_number, l.gas_used, \
     l.status, l.contract_address, l.logged_at, l.confirmed_at";

/// Record store persisted in `<data_dir>/pulse.db`
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database inside a data directory
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        Self::open(&data_dir.join("pulse.db"))
    }

    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let db = Connection::open(db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        // Enable WAL mode for concurrent read access
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(SCHEMA).context("applying schema")?;

        info!(path = %db_path.display(), "Record store initialized");

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

#[async_trait]
impl HouseholdStore for SqliteStore {
    async fn find_by_meter(&self, meter_id: &str) -> Result<Option<HouseholdContext>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare_cached(
            "SELECT id, user_id, meter_id, region, city, members, area_sqm, year_built,
                    heating_type, status
             FROM households WHERE meter_id = ?1",
        )?;

        Ok(stmt.query_row([meter_id], household_from_row).optional()?)
    }

    async fn upsert(&self, household: HouseholdContext) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO households
                (id, user_id, meter_id, region, city, members, area_sqm, year_built,
                 heating_type, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                user_id = ?2, meter_id = ?3, region = ?4, city = ?5, members = ?6,
                area_sqm = ?7, year_built = ?8, heating_type = ?9, status = ?10",
            params![
                household.id,
                household.user_id,
                household.meter_id,
                household.region,
                household.city,
                household.members,
                household.area_sqm,
                household.year_built,
                household.heating_type.as_str(),
                household.status.as_str(),
            ],
        )?;
        debug!(household_id = %household.id, meter_id = %household.meter_id, "Upserted household");
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for SqliteStore {
    async fn create(&self, prediction: NewPrediction) -> Result<Prediction, StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO predictions
                (user_id, household_id, meter_id, timestamp, hour, temperature,
                 consumption_kwh, predicted_price, confidence, actual_price, ledger_confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                prediction.user_id,
                prediction.household_id,
                prediction.meter_id,
                sql_timestamp(prediction.timestamp),
                prediction.hour,
                prediction.temperature,
                prediction.consumption_kwh,
                prediction.predicted_price,
                prediction.confidence,
                prediction.actual_price,
            ],
        )?;
        let id = db.last_insert_rowid();
        Ok(prediction.with_id(id))
    }

    async fn update_confirmation(
        &self,
        id: PredictionId,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE predictions SET ledger_confirmed = 1, ledger_tx = ?2
             WHERE id = ?1 AND ledger_confirmed = 0",
            params![id, tx_hash],
        )?;

        if changed == 1 {
            return Ok(());
        }

        let exists: bool = db
            .query_row("SELECT 1 FROM predictions WHERE id = ?1", [id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);

        if exists {
            Err(StoreError::Constraint(format!(
                "prediction {} is already confirmed",
                id
            )))
        } else {
            Err(StoreError::not_found("prediction", id))
        }
    }

    async fn find(&self, id: PredictionId) -> Result<Option<Prediction>, StoreError> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM predictions WHERE id = ?1", PREDICTION_COLUMNS);
        let mut stmt = db.prepare_cached(&sql)?;
        Ok(stmt.query_row([id], prediction_from_row).optional()?)
    }

    async fn find_many(
        &self,
        filter: &PredictionFilter,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Prediction>, StoreError> {
        let (clause, mut values) = where_clause(filter);
        values.push(Value::Integer(i64::from(limit)));
        let limit_idx = values.len();
        values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        let offset_idx = values.len();

        let sql = format!(
            "SELECT {} FROM predictions{} ORDER BY timestamp DESC, id DESC LIMIT ?{} OFFSET ?{}",
            PREDICTION_COLUMNS, clause, limit_idx, offset_idx
        );
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), prediction_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self, filter: &PredictionFilter) -> Result<u64, StoreError> {
        let (clause, values) = where_clause(filter);
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM predictions{}", clause),
            rusqlite::params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn aggregate(&self, filter: &PredictionFilter) -> Result<PredictionAggregate, StoreError> {
        let (clause, values) = where_clause(filter);
        let db = self.db.lock().await;
        let aggregate = db.query_row(
            &format!(
                "SELECT AVG(predicted_price), AVG(consumption_kwh), MAX(timestamp)
                 FROM predictions{}",
                clause
            ),
            rusqlite::params_from_iter(values),
            |row| {
                let last_timestamp = match row.get::<_, Option<String>>(2)? {
                    Some(_) => Some(timestamp_column(row, 2)?),
                    None => None,
                };
                Ok(PredictionAggregate {
                    average_price: row.get(0)?,
                    average_consumption: row.get(1)?,
                    last_timestamp,
                })
            },
        )?;
        Ok(aggregate)
    }
}

#[async_trait]
impl LedgerLogStore for SqliteStore {
    async fn record(&self, record: LedgerLogRecord) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO ledger_log
                (prediction_id, transaction_hash, block_number, gas_used, status,
                 contract_address, logged_at, confirmed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.prediction_id,
                record.transaction_hash,
                record.block_number as i64,
                record.gas_used as i64,
                record.status.as_str(),
                record.contract_address,
                sql_timestamp(record.logged_at),
                record.confirmed_at.map(sql_timestamp),
            ],
        )?;
        Ok(())
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<LedgerLogRecord>, StoreError> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM ledger_log l WHERE l.transaction_hash = ?1",
            LOG_COLUMNS
        );
        let mut stmt = db.prepare_cached(&sql)?;
        Ok(stmt.query_row([tx_hash], log_from_row).optional()?)
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<LedgerLogRecord>, StoreError> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM ledger_log l
             JOIN predictions p ON p.id = l.prediction_id
             WHERE p.user_id = ?1
             ORDER BY l.logged_at DESC, l.block_number DESC",
            LOG_COLUMNS
        );
        let mut stmt = db.prepare_cached(&sql)?;
        let rows = stmt.query_map([user_id], log_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn where_clause(filter: &PredictionFilter) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(user_id) = filter.user_id {
        values.push(Value::Integer(user_id));
        conditions.push(format!("user_id = ?{}", values.len()));
    }
    if let Some(household_id) = &filter.household_id {
        values.push(Value::Text(household_id.clone()));
        conditions.push(format!("household_id = ?{}", values.len()));
    }
    if let Some(meter_id) = &filter.meter_id {
        values.push(Value::Text(meter_id.clone()));
        conditions.push(format!("meter_id = ?{}", values.len()));
    }
    if let Some(confirmed) = filter.confirmed {
        values.push(Value::Integer(i64::from(confirmed)));
        conditions.push(format!("ledger_confirmed = ?{}", values.len()));
    }
    if let Some(from) = filter.from {
        values.push(Value::Text(sql_timestamp(from)));
        conditions.push(format!("timestamp >= ?{}", values.len()));
    }
    if let Some(until) = filter.until {
        values.push(Value::Text(sql_timestamp(until)));
        conditions.push(format!("timestamp < ?{}", values.len()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

fn sql_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ts: DateTime<chrono::FixedOffset> = parse_column(row, idx)?;
    Ok(ts.with_timezone(&Utc))
}

fn household_from_row(row: &Row<'_>) -> rusqlite::Result<HouseholdContext> {
    Ok(HouseholdContext {
        id: row.get(0)?,
        user_id: row.get(1)?,
        meter_id: row.get(2)?,
        region: row.get(3)?,
        city: row.get(4)?,
        members: row.get(5)?,
        area_sqm: row.get(6)?,
        year_built: row.get(7)?,
        heating_type: parse_column(row, 8)?,
        status: parse_column(row, 9)?,
    })
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    Ok(Prediction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        household_id: row.get(2)?,
        meter_id: row.get(3)?,
        timestamp: timestamp_column(row, 4)?,
        hour: row.get(5)?,
        temperature: row.get(6)?,
        consumption_kwh: row.get(7)?,
        predicted_price: row.get(8)?,
        confidence: row.get(9)?,
        actual_price: row.get(10)?,
        ledger_confirmed: row.get(11)?,
        ledger_tx: row.get(12)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerLogRecord> {
    let confirmed_at = match row.get::<_, Option<String>>(7)? {
        Some(_) => Some(timestamp_column(row, 7)?),
        None => None,
    };

    Ok(LedgerLogRecord {
        prediction_id: row.get(0)?,
        transaction_hash: row.get(1)?,
        block_number: row.get::<_, i64>(2)? as u64,
        gas_used: row.get::<_, i64>(3)? as u64,
        status: parse_column(row, 4)?,
        contract_address: row.get(5)?,
        logged_at: timestamp_column(row, 6)?,
        confirmed_at,
    })
}
