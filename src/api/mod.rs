//! HTTP surface - query endpoints and the ingestion fallback
//!
//! Provides:
//! - Ledger stats, transaction verification, block lookup and audit
//! - Prediction listing, lookup and statistics
//! - Per-meter forecast and optimal hours
//! - `POST /api/simulate` for readings that do not come over NATS

pub mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::node::Services;
use crate::query::QueryError;
use crate::registry::ResolveError;

/// State shared across handlers
pub struct AppState {
    pub node_id: String,
    pub services: Services,
}

pub type SharedState = Arc<AppState>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        // Ingestion fallback
        .route("/api/simulate", post(routes::simulate))
        // Ledger
        .route("/api/ledger/stats", get(routes::ledger_stats))
        .route("/api/ledger/verify/:tx_hash", get(routes::verify_transaction))
        .route("/api/ledger/block/:number", get(routes::get_block))
        .route("/api/ledger/audit", get(routes::audit_ledger))
        .route("/api/users/:user_id/ledger", get(routes::user_ledger))
        // Predictions
        .route("/api/predictions", get(routes::list_predictions))
        .route("/api/predictions/:id", get(routes::get_prediction))
        .route("/api/statistics", get(routes::statistics))
        // Pricing
        .route("/api/quote", get(routes::quote))
        .route("/api/meters/:meter_id/forecast", get(routes::forecast))
        .route("/api/meters/:meter_id/optimal-hours", get(routes::optimal_hours))
        // Health check
        .route("/health", get(routes::health))
        .with_state(state)
}

/// Error returned by handlers, rendered as `{"error": ...}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            other => {
                tracing::error!(error = %other, "Query failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::UnknownMeter(_) => ApiError::NotFound(e.to_string()),
            other => {
                tracing::error!(error = %other, "Household lookup failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}
