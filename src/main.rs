//! # Speech Pipeline Server - Main Application Entry Point
//!
//! HTTP service exposing voice activity detection, language identification,
//! speech recognition and punctuation restoration, individually and as one
//! combined pipeline.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **runtime**: model lifecycle (lazy loading, precision fallback, idle eviction)
//! - **engines**: concrete model backends and the weight store
//! - **pipeline**: stage orchestration and transcript filters
//! - **audio**: upload decoding and normalization
//! - **handlers** / **health**: HTTP endpoints
//! - **middleware**: request logging and API key checks
//! - **error**: HTTP error mapping
//!
//! ## Lifecycle:
//! 1. Load `.env`, configure tracing, load and validate configuration
//! 2. Pick the compute device and build the model registry
//! 3. Prefetch weights when `download_mode = startup`
//! 4. Start the TTL reaper and the HTTP server
//! 5. On SIGINT/SIGTERM stop the server, stop the reaper, unload every model

mod audio;
mod config;
mod device;
mod engines;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod runtime;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{AppConfig, DownloadMode};
use device::DeviceManager;
use engines::{DefaultModelLoader, HubWeightStore};
use pipeline::{PipelineOrchestrator, TextFilterChain};
use runtime::{ModelKind, ModelRegistry, SystemClock, TtlReaper};
use state::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-pipeline-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        ttl_seconds = config.models.ttl_seconds,
        download_mode = %config.models.download_mode,
        auth = !config.server.api_key.is_empty(),
        "Configuration loaded"
    );

    let device = DeviceManager::get_device(config.models.device);
    let device_summary = DeviceManager::summarize(config.models.device, &device);
    info!(device = %device_summary.current_device, "Compute device selected");

    let loader = Arc::new(DefaultModelLoader::new(
        device,
        config.models.vad.clone(),
        config.models.asr_max_decode_tokens,
    ));
    let weights = Arc::new(
        HubWeightStore::new(
            &config.models.model_path,
            &config.models.asr_repo,
            &config.models.lid_repo,
        )
        .with_token(config.models.hf_token.clone()),
    );
    let precision = config.precision.clone();
    let registry = Arc::new(ModelRegistry::new(loader, weights, Arc::new(SystemClock), move |kind| {
        precision.for_kind(kind)
    }));

    if config.models.download_mode == DownloadMode::Startup {
        info!("Prefetching model weights before startup");
        registry.prefetch(&ModelKind::ALL).await?;
    }

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&registry),
        TextFilterChain::new(config.filters.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = TtlReaper::new(
        Arc::clone(&registry),
        config.models.ttl(),
        config.models.reaper_interval(),
    )
    .spawn(shutdown_rx);

    let app_state =
        AppState::new(config.clone(), Arc::clone(&registry), orchestrator, device_summary);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let api_key = config.server.api_key.clone();
    let api_key_header = config.server.api_key_header.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/v1")
                    .wrap(middleware::ApiKeyAuth::new(api_key.clone(), api_key_header.clone()))
                    .route("/vad", web::post().to(handlers::vad))
                    .route("/lid", web::post().to(handlers::lid))
                    .route("/asr", web::post().to(handlers::asr))
                    .route("/punc", web::post().to(handlers::punc))
                    .route("/process_all", web::post().to(handlers::process_all))
                    .route("/models/status", web::get().to(handlers::models_status)),
            )
            .route("/healthz", web::get().to(health::health_check))
    })
    .workers(config.server.workers)
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown_tx.send_replace(true);
    if let Err(e) = reaper.await {
        error!("Reaper task error: {}", e);
    }
    registry.unload_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Tracing to stdout, filtered by `RUST_LOG`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_pipeline_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Ctrl+C handler failed: {}", e);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl+C handler failed: {}", e);
        }
    }
}
