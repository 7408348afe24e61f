//! Pricing engine - multiplicative factor model for energy prices
//!
//! A reading is priced by multiplying a base price with independent factors,
//! each computed from one input dimension, then applying a bounded market
//! volatility multiplier. Two named modes exist:
//! - `Household`: region, size, area, heating/age/season, time, weather, consumption
//! - `ContextFree`: time, weather and consumption only, with its own constants
//!
//! The mode is selected by whether a household context is available.

pub mod factors;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::models::HouseholdContext;
use factors::{context_free, household};

pub const CONFIDENCE_MIN: u8 = 70;
pub const CONFIDENCE_MAX: u8 = 95;

/// Number of hours returned by [`PricingEngine::optimal_hours`]
pub const OPTIMAL_HOURS: usize = 5;

/// Largest consumption a single reading may report. The consumption factor
/// grows linearly, so unbounded input would overflow the price.
pub const MAX_CONSUMPTION_KWH: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PricingError {
    #[error("hour out of range: {0}")]
    InvalidHour(u8),

    #[error("month out of range: {0}")]
    InvalidMonth(u32),

    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("consumption of {0} kWh exceeds the per-reading limit")]
    ConsumptionOutOfRange(f64),
}

/// Validated pricing inputs for a single hour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuery {
    hour: u8,
    month: u32,
    temperature: f64,
    consumption_kwh: f64,
}

impl PriceQuery {
    pub fn new(
        hour: u8,
        month: u32,
        temperature: f64,
        consumption_kwh: f64,
    ) -> Result<Self, PricingError> {
        if hour > 23 {
            return Err(PricingError::InvalidHour(hour));
        }
        if !(1..=12).contains(&month) {
            return Err(PricingError::InvalidMonth(month));
        }
        if !temperature.is_finite() {
            return Err(PricingError::NonFinite { field: "temperature" });
        }
        if !consumption_kwh.is_finite() {
            return Err(PricingError::NonFinite { field: "consumption" });
        }
        if consumption_kwh > MAX_CONSUMPTION_KWH {
            return Err(PricingError::ConsumptionOutOfRange(consumption_kwh));
        }

        Ok(Self {
            hour,
            month,
            temperature,
            consumption_kwh,
        })
    }

    /// Hour and season taken from a UTC timestamp
    pub fn at(
        timestamp: DateTime<Utc>,
        temperature: f64,
        consumption_kwh: f64,
    ) -> Result<Self, PricingError> {
        Self::new(
            timestamp.hour() as u8,
            timestamp.month(),
            temperature,
            consumption_kwh,
        )
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }
}

/// Which factor table produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    Household,
    ContextFree,
}

/// Output of the pricing engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// €/kWh, rounded to 4 decimals
    pub price: f64,
    pub confidence: u8,
    pub mode: PricingMode,
}

/// Seed source for the market volatility term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilitySource {
    /// Seeded from the wall clock (seconds)
    #[default]
    Clock,
    /// Fixed seed, reproducible output
    Fixed(u64),
}

impl VolatilitySource {
    fn seed(&self) -> u64 {
        match self {
            VolatilitySource::Clock => Utc::now().timestamp().unsigned_abs(),
            VolatilitySource::Fixed(seed) => *seed,
        }
    }

    pub fn multiplier(&self) -> f64 {
        volatility_multiplier(self.seed())
    }
}

/// Maps a seed onto the ±3% volatility band
pub fn volatility_multiplier(seed: u64) -> f64 {
    0.97 + (seed % 100) as f64 / 100.0 * 0.06
}

/// Coarse price band used for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceCategory {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

impl PriceCategory {
    pub fn of(price: f64) -> Self {
        match price {
            p if p < 0.08 => PriceCategory::VeryLow,
            p if p < 0.10 => PriceCategory::Low,
            p if p < 0.12 => PriceCategory::Normal,
            p if p < 0.14 => PriceCategory::High,
            _ => PriceCategory::VeryHigh,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceCategory::VeryLow => "very_low",
            PriceCategory::Low => "low",
            PriceCategory::Normal => "normal",
            PriceCategory::High => "high",
            PriceCategory::VeryHigh => "very_high",
        }
    }
}

/// One hour of a 24-hour forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub hour: u8,
    pub temperature: f64,
    pub consumption_kwh: f64,
    pub predicted_price: f64,
    pub confidence: u8,
    pub category: PriceCategory,
}

/// Pure pricing function plus its auxiliary operations
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingEngine {
    volatility: VolatilitySource,
}

impl PricingEngine {
    pub fn new(volatility: VolatilitySource) -> Self {
        Self { volatility }
    }

    /// Price a reading; household mode when `ctx` is present, context-free otherwise
    pub fn predict(&self, ctx: Option<&HouseholdContext>, query: &PriceQuery) -> Quote {
        self.quote(ctx, query, self.volatility.multiplier())
    }

    fn quote(&self, ctx: Option<&HouseholdContext>, query: &PriceQuery, volatility: f64) -> Quote {
        let (raw, confidence, mode) = match ctx {
            Some(ctx) => (
                household_price(ctx, query),
                household::confidence(ctx, query.temperature),
                PricingMode::Household,
            ),
            None => (
                context_free_price(query),
                context_free::confidence(query.temperature, query.consumption_kwh),
                PricingMode::ContextFree,
            ),
        };

        Quote {
            price: round_price(raw * volatility),
            confidence: clamp_confidence(confidence),
            mode,
        }
    }

    /// Simulated settled price for display, not part of the pricing contract
    pub fn actual_price(&self, predicted_price: f64, hour: u8) -> f64 {
        match self.volatility {
            VolatilitySource::Clock => {
                simulate_actual_price(predicted_price, hour, &mut rand::thread_rng())
            }
            VolatilitySource::Fixed(seed) => {
                let mut rng = StdRng::seed_from_u64(seed ^ u64::from(hour));
                simulate_actual_price(predicted_price, hour, &mut rng)
            }
        }
    }

    /// The five cheapest hours of the day, ties broken by ascending hour
    pub fn optimal_hours(
        &self,
        ctx: Option<&HouseholdContext>,
        month: u32,
        temperature: f64,
        consumption_kwh: f64,
    ) -> Result<Vec<u8>, PricingError> {
        // One volatility sample for the whole day keeps hours comparable
        let volatility = self.volatility.multiplier();

        let mut priced = (0..24u8)
            .map(|hour| {
                let query = PriceQuery::new(hour, month, temperature, consumption_kwh)?;
                Ok((hour, self.quote(ctx, &query, volatility).price))
            })
            .collect::<Result<Vec<_>, PricingError>>()?;

        // sort_by is stable, so equal prices keep ascending hour order
        priced.sort_by(|a, b| a.1.total_cmp(&b.1));

        Ok(priced
            .into_iter()
            .take(OPTIMAL_HOURS)
            .map(|(hour, _)| hour)
            .collect())
    }

    /// Hourly forecast for the 24 hours starting at `start`
    pub fn forecast(
        &self,
        ctx: Option<&HouseholdContext>,
        current_temperature: f64,
        start: DateTime<Utc>,
    ) -> Result<Vec<ForecastPoint>, PricingError> {
        let volatility = self.volatility.multiplier();

        (0..24)
            .map(|offset| {
                let at = start + Duration::hours(offset);
                let hour = at.hour() as u8;
                let temperature = forecast_temperature(current_temperature, hour);
                let consumption_kwh = forecast_consumption(hour);
                let query = PriceQuery::at(at, temperature, consumption_kwh)?;
                let quote = self.quote(ctx, &query, volatility);

                Ok(ForecastPoint {
                    timestamp: at,
                    hour,
                    temperature,
                    consumption_kwh,
                    predicted_price: quote.price,
                    confidence: quote.confidence,
                    category: PriceCategory::of(quote.price),
                })
            })
            .collect()
    }
}

fn household_price(ctx: &HouseholdContext, query: &PriceQuery) -> f64 {
    household::BASE_PRICE
        * household::region(ctx)
        * household::members(ctx.members)
        * household::area(ctx.area_sqm)
        * household::efficiency(ctx.heating_type, ctx.year_built, query.month)
        * household::time_of_day(query.hour)
        * household::temperature(query.temperature)
        * household::consumption(query.consumption_kwh)
}

fn context_free_price(query: &PriceQuery) -> f64 {
    context_free::BASE_PRICE
        * context_free::time_of_day(query.hour)
        * context_free::temperature(query.temperature)
        * context_free::consumption(query.consumption_kwh)
}

/// ±10% noise, with an occasional +15% spike in the 19-21h window
pub fn simulate_actual_price<R: Rng + ?Sized>(predicted_price: f64, hour: u8, rng: &mut R) -> f64 {
    let mut noise = rng.gen_range(-0.10..=0.10);
    if (19..=21).contains(&hour) && rng.gen_bool(0.1) {
        noise += 0.15;
    }
    round_price(predicted_price * (1.0 + noise))
}

fn forecast_temperature(current: f64, hour: u8) -> f64 {
    match hour {
        h if h < 6 || h > 21 => current - 3.0,
        12..=15 => current + 4.0,
        _ => current,
    }
}

fn forecast_consumption(hour: u8) -> f64 {
    if (18..=22).contains(&hour) {
        2.5
    } else {
        0.8
    }
}

fn round_price(price: f64) -> f64 {
    (price * 10_000.0).round() / 10_000.0
}

fn clamp_confidence(confidence: i32) -> u8 {
    confidence.clamp(i32::from(CONFIDENCE_MIN), i32::from(CONFIDENCE_MAX)) as u8
}
