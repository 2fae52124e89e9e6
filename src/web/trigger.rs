//! Manual sync trigger.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::state::AppState;
use crate::sync::SyncError;
use crate::web::error::{ApiError, ApiErrorCode, store_error};

/// Response for `POST /api/trigger-update`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub status: &'static str,
    pub message: String,
}

/// `POST /api/trigger-update` - start a sync without waiting for it.
#[instrument(skip_all)]
pub async fn trigger_update(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    match state.scheduler.trigger().await {
        Ok(()) => {
            info!("Manual sync triggered");
            Ok((
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    status: "started",
                    message: "Sync run started".to_string(),
                }),
            ))
        }
        Err(SyncError::RunAlreadyInProgress) => Ok((
            StatusCode::CONFLICT,
            Json(TriggerResponse {
                status: "already_in_progress",
                message: "A sync run is already in progress".to_string(),
            }),
        )),
        Err(SyncError::Lock(e)) => Err(store_error("Could not take the sync lock", e)),
        Err(e) => {
            error!(error = %e, "Failed to trigger sync");
            Err(ApiError::new(ApiErrorCode::Internal, e.to_string()))
        }
    }
}
