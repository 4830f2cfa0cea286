use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gamesmith::config::AppConfig;
use gamesmith::router;
use gamesmith::service::game_service::GameService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gamesmith=debug,tower_http=debug".into()),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = AppConfig::from_env();
    if config.text.api_key.is_none() {
        warn!("TOGETHER_API_KEY is not set; code generation will fail");
    }
    if config.image.api_key.is_none() {
        warn!("FAL_KEY is not set; image generation will fail");
    }
    info!(
        "Text model {}, image model {} (timeout {}ms)",
        config.text.model,
        config.image.model,
        config.image.timeout.as_millis()
    );

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let game_service = GameService::from_config(&config);

    // ── Router ────────────────────────────────────────────────────────────────
    let app = router(game_service).layer(TraceLayer::new_for_http());

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
