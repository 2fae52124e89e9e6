//! Health, sync status, and freshness handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{trace, warn};

use crate::data::models::StoreStats;
use crate::state::AppState;
use crate::status::{Freshness, StatusReport};
use crate::web::error::{ApiError, store_error};

/// The portal publishes incidents roughly a week after they occur.
const EXPECTED_LAG_DAYS: i64 = 7;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusResponse {
    #[serde(flatten)]
    pub report: StatusReport,
    /// Absent when the store could not be queried.
    pub database: Option<StoreStats>,
    pub version: String,
    pub commit: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessResponse {
    #[serde(flatten)]
    pub freshness: Freshness,
    pub expected_lag_days: i64,
    pub total_records: i64,
    pub latest_record_at: Option<chrono::DateTime<Utc>>,
}

/// Pick up runs written by other processes. A stale view beats an error.
async fn refresh(state: &AppState) {
    if let Err(e) = state.tracker.reload().await {
        warn!(error = %e, "status file could not be reloaded");
    }
}

/// `GET /api/health` - liveness plus a store ping.
pub(super) async fn health(State(state): State<AppState>) -> Response {
    trace!("health check requested");
    match state.store.ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database": "connected",
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "disconnected",
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
                .into_response()
        }
    }
}

/// `GET /api/update-status` - checkpoint, run history, and store statistics.
pub(super) async fn update_status(State(state): State<AppState>) -> Json<UpdateStatusResponse> {
    refresh(&state).await;
    let report = state.tracker.report().await;
    let database = match state.store.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "store statistics unavailable");
            None
        }
    };

    Json(UpdateStatusResponse {
        report,
        database,
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: env!("GIT_COMMIT_HASH").to_string(),
    })
}

/// `GET /api/data-freshness` - how far behind the synced data is.
pub(super) async fn data_freshness(
    State(state): State<AppState>,
) -> Result<Json<FreshnessResponse>, ApiError> {
    refresh(&state).await;
    let freshness = state.tracker.freshness().await;
    let stats = state
        .store
        .stats()
        .await
        .map_err(|e| store_error("Failed to read store statistics", e))?;

    Ok(Json(FreshnessResponse {
        freshness,
        expected_lag_days: EXPECTED_LAG_DAYS,
        total_records: stats.total_records,
        latest_record_at: stats.latest_occurred_at,
    }))
}
