use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::AppError;
use crate::models::{GenerateBody, ImageRequest};
use crate::service::game_service::GameService;

/// POST `/api/generate` — runs one full iteration and reports the new version
pub async fn generate_handler(
    State(svc): State<GameService>,
    Json(body): Json<GenerateBody>,
) -> Response {
    match svc.run_iteration(&body.instruction).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/versions` — committed version summaries, oldest first
pub async fn list_versions_handler(State(svc): State<GameService>) -> impl IntoResponse {
    Json(svc.store().history().await)
}

/// POST `/api/image` — sketch + hint to a generated image
pub async fn image_handler(
    State(svc): State<GameService>,
    Json(request): Json<ImageRequest>,
) -> Response {
    match svc.generate_image(&request).await {
        Ok(image) => Json(image).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        AppError::AlreadyInProgress => StatusCode::CONFLICT,
        AppError::MissingCredentials { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AppError::ConnectionError { .. }
        | AppError::ProviderError { .. }
        | AppError::EmptyResult
        | AppError::ExtractionError { .. } => StatusCode::BAD_GATEWAY,
        AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &AppError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    let body = json!({ "kind": err.kind(), "message": err.to_string() });
    (status, Json(body)).into_response()
}
