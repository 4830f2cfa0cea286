pub mod api_routes;
pub mod preview_routes;
pub mod ws_routes;

use axum::routing::{get, post};
use axum::Router;

use crate::service::game_service::GameService;

/// Every route the host serves, without transport layers.
pub fn router(svc: GameService) -> Router {
    Router::new()
        // Page routes
        .route("/", get(preview_routes::index_handler))
        .route("/preview", get(preview_routes::current_preview_handler))
        .route("/preview/{version}", get(preview_routes::version_preview_handler))
        // API routes
        .route("/api/generate", post(api_routes::generate_handler))
        .route("/api/versions", get(api_routes::list_versions_handler))
        .route("/api/image", post(api_routes::image_handler))
        // Streaming routes
        .route("/ws/generate", get(ws_routes::ws_generate_handler))
        .route("/ws/voice", get(ws_routes::ws_voice_handler))
        .with_state(svc)
}
