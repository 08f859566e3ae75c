mod app;
mod artifact;
mod cache;
mod config;
mod delivery;
mod error;
mod media;
mod menu;
mod orchestrator;
mod request;
mod source;
#[cfg(test)]
mod testing;
mod ytdlp;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use app::AppState;
use cache::InfoCache;
use config::Settings;
use media::MediaRunner;
use orchestrator::Orchestrator;
use source::YtDlpSource;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();

    if let Err(e) = std::fs::create_dir_all(&settings.temp_dir) {
        error!("Cannot create temp directory {:?}: {e}", settings.temp_dir);
        return ExitCode::FAILURE;
    }

    info!("Starting server on port {}", settings.port);
    info!("Temp directory: {:?}", settings.temp_dir);
    info!("Delivery mode: {}", settings.delivery_mode.as_str());
    info!("ffmpeg: {}", settings.ffmpeg_path.display());

    // Stream bodies can run for the whole download window, so only connecting is capped.
    let http_client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(20)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cache = match &settings.redis_host {
        Some(host) => InfoCache::connect(host, settings.redis_port, settings.cache_ttl).await,
        None => {
            info!("REDIS_HOST not set, extraction caching disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    artifact::spawn_cleanup_task(
        settings.temp_dir.clone(),
        Duration::from_secs(settings.stale_artifact_age),
        shutdown.clone(),
    );

    let source: Arc<dyn source::StreamSource> =
        Arc::new(YtDlpSource::new(&settings, http_client, cache.clone()));
    let delivery = delivery::strategy_for(
        settings.delivery_mode,
        MediaRunner::new(&settings.ffmpeg_path),
        settings.temp_dir.clone(),
    );
    let orchestrator = Orchestrator::new(
        source.clone(),
        delivery,
        settings.temp_dir.clone(),
        settings.download_deadline(),
        shutdown.clone(),
    );

    let addr = format!("0.0.0.0:{}", settings.port);
    let state = AppState {
        settings: Arc::new(settings),
        source,
        orchestrator: Arc::new(orchestrator),
        cache,
    };
    let router = app::build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("ytmux-server listening on {addr}");
    info!("   Extraction: yt-dlp via PyO3");

    let signal = shutdown.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down, cancelling in-flight downloads");
            signal.cancel();
        })
        .await;

    shutdown.cancel();
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
