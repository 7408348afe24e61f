//! API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, SharedState};
use crate::gateway::{DropReason, IngestOutcome};
use crate::ledger::LedgerStats;
use crate::models::{MeterReading, Prediction, PredictionFilter, PredictionId, UserId};
use crate::pricing::{ForecastPoint, PriceCategory, PriceQuery, PricingError, Quote};
use crate::query::{
    BlockView, LogView, PredictionPage, PredictionStatistics, QueryError, UserLedgerSummary,
};

/// Temperature assumed when a pricing request does not give one
const DEFAULT_TEMPERATURE: f64 = 10.0;
const DEFAULT_CONSUMPTION_KWH: f64 = 1.0;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

impl From<PricingError> for ApiError {
    fn from(e: PricingError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Health check endpoint
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "nodeId": state.node_id }))
}

// === Ingestion ===

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    pub prediction_id: PredictionId,
    pub meter_id: String,
    pub predicted_price: f64,
    pub confidence: u8,
    pub hour: u8,
    pub used_fallback_timestamp: bool,
    /// Confirmation runs in the background
    pub ledger_pending: bool,
}

/// POST /api/simulate - HTTP fallback for meter readings
pub async fn simulate(
    State(state): State<SharedState>,
    Json(reading): Json<MeterReading>,
) -> Result<(StatusCode, Json<SimulateResponse>), ApiError> {
    let outcome = state
        .services
        .gateway
        .ingest(reading)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match outcome {
        IngestOutcome::Accepted {
            prediction,
            used_fallback_timestamp,
            ..
        } => Ok((
            StatusCode::CREATED,
            Json(SimulateResponse {
                prediction_id: prediction.id,
                meter_id: prediction.meter_id,
                predicted_price: prediction.predicted_price,
                confidence: prediction.confidence,
                hour: prediction.hour,
                used_fallback_timestamp,
                ledger_pending: true,
            }),
        )),
        IngestOutcome::Dropped {
            meter_id,
            reason: DropReason::UnknownMeter,
        } => Err(ApiError::NotFound(format!("unknown meter: {}", meter_id))),
        IngestOutcome::Dropped {
            meter_id,
            reason: DropReason::NonFiniteMeasurement,
        } => Err(ApiError::BadRequest(format!(
            "reading from {} has non-finite measurements",
            meter_id
        ))),
        IngestOutcome::Dropped {
            meter_id,
            reason: DropReason::ImplausibleMeasurement,
        } => Err(ApiError::BadRequest(format!(
            "reading from {} reports implausible consumption",
            meter_id
        ))),
    }
}

// === Ledger ===

/// GET /api/ledger/stats
pub async fn ledger_stats(State(state): State<SharedState>) -> Json<LedgerStats> {
    Json(state.services.query.stats().await)
}

/// GET /api/ledger/verify/:tx_hash
pub async fn verify_transaction(
    State(state): State<SharedState>,
    Path(tx_hash): Path<String>,
) -> Response {
    match state.services.query.verify(&tx_hash).await {
        Ok(view) => Json(view).into_response(),
        Err(QueryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "verified": false,
                "error": "Transaction not found in ledger",
            })),
        )
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /api/ledger/block/:number
pub async fn get_block(
    State(state): State<SharedState>,
    Path(number): Path<u64>,
) -> Result<Json<BlockView>, ApiError> {
    Ok(Json(state.services.query.block(number).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub valid: bool,
    pub violation: Option<String>,
}

/// GET /api/ledger/audit - Walk the chain and check every link
pub async fn audit_ledger(State(state): State<SharedState>) -> Json<AuditResponse> {
    let result = state.services.ledger.audit().await;
    Json(AuditResponse {
        valid: result.is_ok(),
        violation: result.err().map(|v| v.to_string()),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLedgerResponse {
    pub logs: Vec<LogView>,
    pub total: usize,
    pub summary: UserLedgerSummary,
}

/// GET /api/users/:user_id/ledger
pub async fn user_ledger(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserLedgerResponse>, ApiError> {
    let logs = state.services.query.logs_for_user(user_id).await?;
    let summary = state.services.query.user_summary(user_id).await?;

    Ok(Json(UserLedgerResponse {
        total: logs.len(),
        logs,
        summary,
    }))
}

// === Predictions ===

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPredictionsParams {
    pub user_id: Option<UserId>,
    pub household_id: Option<String>,
    pub meter_id: Option<String>,
    /// First day included, `YYYY-MM-DD`
    pub start_date: Option<NaiveDate>,
    /// Last day included, `YYYY-MM-DD`
    pub end_date: Option<NaiveDate>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// GET /api/predictions - Paginated listing, newest first
pub async fn list_predictions(
    State(state): State<SharedState>,
    Query(params): Query<ListPredictionsParams>,
) -> Result<Json<PredictionPage>, ApiError> {
    let page = params.page.filter(|p| *p >= 1).unwrap_or(1);
    let limit = params
        .limit
        .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
        .unwrap_or(DEFAULT_PAGE_SIZE);

    let filter = PredictionFilter {
        user_id: params.user_id,
        household_id: params.household_id,
        meter_id: params.meter_id,
        ..PredictionFilter::default()
    }
    .between(
        params.start_date.map(start_of_day),
        // The whole end date is included
        params.end_date.map(|d| start_of_day(d) + Duration::days(1)),
    );

    Ok(Json(state.services.query.predictions(&filter, page, limit).await?))
}

/// GET /api/predictions/:id
pub async fn get_prediction(
    State(state): State<SharedState>,
    Path(id): Path<PredictionId>,
) -> Result<Json<Prediction>, ApiError> {
    Ok(Json(state.services.query.prediction(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsParams {
    pub user_id: Option<UserId>,
    pub household_id: Option<String>,
    pub meter_id: Option<String>,
}

/// GET /api/statistics
pub async fn statistics(
    State(state): State<SharedState>,
    Query(params): Query<StatisticsParams>,
) -> Result<Json<PredictionStatistics>, ApiError> {
    let filter = PredictionFilter {
        user_id: params.user_id,
        household_id: params.household_id,
        meter_id: params.meter_id,
        ..PredictionFilter::default()
    };
    Ok(Json(state.services.query.statistics(filter).await?))
}

// === Pricing ===

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub hour: u8,
    pub month: Option<u32>,
    pub temperature: Option<f64>,
    pub consumption: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    #[serde(flatten)]
    pub quote: Quote,
    pub category: PriceCategory,
}

/// GET /api/quote - Context-free price for one hour
pub async fn quote(
    State(state): State<SharedState>,
    Query(params): Query<QuoteParams>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let query = PriceQuery::new(
        params.hour,
        params.month.unwrap_or_else(|| Utc::now().month()),
        params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        params.consumption.unwrap_or(DEFAULT_CONSUMPTION_KWH),
    )?;
    let quote = state.services.gateway.pricing().predict(None, &query);

    Ok(Json(QuoteResponse {
        category: PriceCategory::of(quote.price),
        quote,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct WeatherParams {
    pub temperature: Option<f64>,
    pub consumption: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResponse {
    pub meter_id: String,
    pub forecast: Vec<ForecastPoint>,
}

/// GET /api/meters/:meter_id/forecast?temperature=
pub async fn forecast(
    State(state): State<SharedState>,
    Path(meter_id): Path<String>,
    Query(params): Query<WeatherParams>,
) -> Result<Json<ForecastResponse>, ApiError> {
    let household = state.services.registry.resolve(&meter_id).await?;
    let forecast = state.services.gateway.pricing().forecast(
        Some(&household),
        params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        Utc::now(),
    )?;

    Ok(Json(ForecastResponse { meter_id, forecast }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimalHoursResponse {
    pub meter_id: String,
    pub hours: Vec<u8>,
}

/// GET /api/meters/:meter_id/optimal-hours?temperature=&consumption=
pub async fn optimal_hours(
    State(state): State<SharedState>,
    Path(meter_id): Path<String>,
    Query(params): Query<WeatherParams>,
) -> Result<Json<OptimalHoursResponse>, ApiError> {
    let household = state.services.registry.resolve(&meter_id).await?;
    let hours = state.services.gateway.pricing().optimal_hours(
        Some(&household),
        Utc::now().month(),
        params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        params.consumption.unwrap_or(DEFAULT_CONSUMPTION_KWH),
    )?;

    Ok(Json(OptimalHoursResponse { meter_id, hours }))
}
