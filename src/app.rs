use std::sync::Arc;

use axum::extract::{Json, Query, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::cache::InfoCache;
use crate::config::Settings;
use crate::error::AppError;
use crate::menu::{build_menu, FormatMenu};
use crate::orchestrator::Orchestrator;
use crate::request::{DownloadQuery, DownloadRequest, VideoReference};
use crate::source::StreamSource;

// ============= Application State =============

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub source: Arc<dyn StreamSource>,
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Option<InfoCache>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    url: Option<String>,
}

// ============= Handlers =============

/// GET /video-info: the format menu for one video.
async fn video_info_handler(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<FormatMenu>, AppError> {
    let reference = VideoReference::parse(query.url.as_deref().unwrap_or(""))?;
    let info = state.source.probe(&reference).await?;
    let menu = build_menu(&info);
    info!(
        "Menu for {}: {} video, {} audio",
        reference.id(),
        menu.video_formats.len(),
        menu.audio_formats.len()
    );
    Ok(Json(menu))
}

/// GET /download: stream the requested file as an attachment.
async fn download_handler(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let request = DownloadRequest::from_query(query)?;
    state.orchestrator.download(request).await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let redis_status = match &state.cache {
        Some(cache) if cache.ping().await => "connected",
        Some(_) => "error",
        None => "disabled",
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "deliveryMode": state.orchestrator.delivery_mode().as_str(),
            "redis": redis_status,
        })),
    )
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Route not found"})),
    )
}

// ============= Router =============

fn routes() -> Router<AppState> {
    Router::new()
        .route("/video-info", get(video_info_handler))
        .route("/download", get(download_handler))
        .route("/health", get(health_handler))
}

fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = if origin == "*" {
        AllowOrigin::from(Any)
    } else {
        match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(e) => {
                warn!("Invalid CORS_ORIGIN {origin:?} ({e}), allowing any origin");
                AllowOrigin::from(Any)
            }
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            HeaderName::from_static("x-filename"),
            header::CONTENT_LENGTH,
        ])
}

/// Every route is served both at the root and under `/api`.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origin);
    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .fallback(not_found_handler)
        .layer(cors)
        .with_state(state)
}
