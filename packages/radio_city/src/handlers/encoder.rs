use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_supervisor::{ConfigError, ControlError, RelayConfigPatch};
use tracing::{info, warn};

use crate::AppState;

// =============================================================================
// Control errors → HTTP
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] ControlError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::AlreadyRunning | ControlError::Busy => StatusCode::CONFLICT,
            ControlError::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::ConfigInvalid(ConfigError::OutOfRange { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ControlError::ConfigInvalid(ConfigError::Persist(_)) | ControlError::SupervisorGone => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("Encoder control failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

pub async fn start_encoder_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.supervisor.start().await?;
    info!("Encoder start accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response())
}

pub async fn stop_encoder_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.stop().await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn restart_encoder_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.supervisor.restart().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response())
}

pub async fn encoder_status_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.get_status().await?))
}

// =============================================================================
// Configuration
// =============================================================================

/// Current encoder configuration, credential masked.
pub async fn get_encoder_config_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.get_config().await?.redacted()))
}

/// Validate and apply a partial update. Never restarts the encoder.
pub async fn patch_encoder_config_handler(
    State(state): State<AppState>,
    Json(patch): Json<RelayConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if patch.is_empty() {
        return Ok(Json(state.supervisor.get_config().await?.redacted()));
    }
    let updated = state.supervisor.update_config(patch).await?;
    info!("Encoder config updated");
    Ok(Json(updated.redacted()))
}
