//! Pipeline models - shared types for readings, households, predictions and ledger records
//!
//! Wire-facing types serialize with camelCase field names to match the
//! meter transport schema and the query surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned to a prediction by the record store
pub type PredictionId = i64;

/// Identifier of the user owning a household
pub type UserId = i64;

//=============================================================================
// READINGS
//=============================================================================

/// A telemetry sample published by a smart meter.
///
/// Transient: readings are never persisted as-is, only the prediction
/// derived from them is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    pub meter_id: String,
    /// RFC3339 timestamp as sent by the device
    pub timestamp: String,
    /// Outdoor temperature in Celsius
    pub temperature: f64,
    pub consumption_kwh: f64,
}

impl MeterReading {
    /// Parse the device timestamp, `None` when it is not valid RFC3339
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn has_finite_measurements(&self) -> bool {
        self.temperature.is_finite() && self.consumption_kwh.is_finite()
    }
}

//=============================================================================
// HOUSEHOLDS
//=============================================================================

/// Heating system installed in a household
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingType {
    Electric,
    NaturalGas,
    HeatPump,
    Biomass,
}

impl HeatingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeatingType::Electric => "electric",
            HeatingType::NaturalGas => "natural_gas",
            HeatingType::HeatPump => "heat_pump",
            HeatingType::Biomass => "biomass",
        }
    }
}

impl FromStr for HeatingType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "electric" => Ok(HeatingType::Electric),
            "natural_gas" | "gas" => Ok(HeatingType::NaturalGas),
            "heat_pump" => Ok(HeatingType::HeatPump),
            "biomass" => Ok(HeatingType::Biomass),
            other => Err(UnknownVariant::new("heating type", other)),
        }
    }
}

/// Lifecycle status of a household
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseholdStatus {
    #[default]
    Active,
    Archived,
}

impl HouseholdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HouseholdStatus::Active => "active",
            HouseholdStatus::Archived => "archived",
        }
    }
}

impl FromStr for HouseholdStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(HouseholdStatus::Active),
            "archived" => Ok(HouseholdStatus::Archived),
            other => Err(UnknownVariant::new("household status", other)),
        }
    }
}

/// Household record resolved from a meter id, read-only to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdContext {
    pub id: String,
    pub user_id: UserId,
    pub meter_id: String,
    pub region: String,
    pub city: String,
    pub members: u32,
    pub area_sqm: f64,
    pub year_built: i32,
    pub heating_type: HeatingType,
    #[serde(default)]
    pub status: HouseholdStatus,
}

impl HouseholdContext {
    pub fn is_archived(&self) -> bool {
        self.status == HouseholdStatus::Archived
    }
}

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

//=============================================================================
// PREDICTIONS
//=============================================================================

/// A prediction before the record store has assigned it an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrediction {
    pub user_id: UserId,
    pub household_id: String,
    pub meter_id: String,
    pub timestamp: DateTime<Utc>,
    pub hour: u8,
    pub temperature: f64,
    pub consumption_kwh: f64,
    pub predicted_price: f64,
    pub confidence: u8,
    pub actual_price: Option<f64>,
}

impl NewPrediction {
    /// Attach the store-assigned id; new predictions always start unconfirmed
    pub fn with_id(self, id: PredictionId) -> Prediction {
        Prediction {
            id,
            user_id: self.user_id,
            household_id: self.household_id,
            meter_id: self.meter_id,
            timestamp: self.timestamp,
            hour: self.hour,
            temperature: self.temperature,
            consumption_kwh: self.consumption_kwh,
            predicted_price: self.predicted_price,
            confidence: self.confidence,
            actual_price: self.actual_price,
            ledger_confirmed: false,
            ledger_tx: None,
        }
    }
}

/// Priced outcome of an accepted reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: PredictionId,
    pub user_id: UserId,
    pub household_id: String,
    pub meter_id: String,
    pub timestamp: DateTime<Utc>,
    pub hour: u8,
    pub temperature: f64,
    pub consumption_kwh: f64,
    pub predicted_price: f64,
    /// Self-reported certainty, always within 70..=95
    pub confidence: u8,
    pub actual_price: Option<f64>,
    pub ledger_confirmed: bool,
    pub ledger_tx: Option<String>,
}

/// Filter used by the record store's find/count operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionFilter {
    pub user_id: Option<UserId>,
    pub household_id: Option<String>,
    pub meter_id: Option<String>,
    pub confirmed: Option<bool>,
    /// Inclusive lower bound on the event timestamp
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the event timestamp
    pub until: Option<DateTime<Utc>>,
}

impl PredictionFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn for_meter(meter_id: impl Into<String>) -> Self {
        Self {
            meter_id: Some(meter_id.into()),
            ..Self::default()
        }
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = Some(confirmed);
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.until = until;
        self
    }

    pub fn matches(&self, prediction: &Prediction) -> bool {
        self.user_id.map_or(true, |u| prediction.user_id == u)
            && self
                .household_id
                .as_deref()
                .map_or(true, |h| prediction.household_id == h)
            && self
                .meter_id
                .as_deref()
                .map_or(true, |m| prediction.meter_id == m)
            && self
                .confirmed
                .map_or(true, |c| prediction.ledger_confirmed == c)
            && self.from.map_or(true, |from| prediction.timestamp >= from)
            && self.until.map_or(true, |until| prediction.timestamp < until)
    }
}

//=============================================================================
// LEDGER LOG RECORDS
//=============================================================================

/// Status of an append-time log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Confirmed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Confirmed => "confirmed",
            LogStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LogStatus::Pending),
            "confirmed" => Ok(LogStatus::Confirmed),
            "failed" => Ok(LogStatus::Failed),
            other => Err(UnknownVariant::new("log status", other)),
        }
    }
}

/// Durable record written after a successful ledger append.
///
/// Persisted separately from the in-memory chain; verification reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerLogRecord {
    pub prediction_id: PredictionId,
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub status: LogStatus,
    pub contract_address: String,
    pub logged_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}
