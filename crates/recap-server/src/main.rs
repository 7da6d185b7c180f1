//! Recap API server binary.
//!
//! Hosts the HTTP/WebSocket API and the pipeline controller in one
//! process; the in-process progress bus connects them.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recap_blob::{BlobStore, MemoryBlobStore, S3BlobStore};
use recap_engine::remote::{
    HttpChapterProvider, HttpMediaTranscoder, HttpProviderConfig, HttpSpeechSynthesizer,
    HttpVisualDescriber, WebhookBillingSink,
};
use recap_engine::{
    BillingSink, EngineConfig, EngineDeps, LogBillingSink, PipelineController, ProgressBus,
    ProviderSet,
};
use recap_gate::CallGate;
use recap_server::{build_router, AppState, ServerConfig};
use recap_store::{
    JobStore, MemoryJobStore, MemoryLedger, QuotaLedger, RedisJobStore, RedisLedger,
    RedisStoreConfig,
};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("recap=info".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

fn required_provider(prefix: &str) -> HttpProviderConfig {
    match HttpProviderConfig::from_env(prefix) {
        Some(config) => config,
        None => {
            error!("{prefix}_URL is not set");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting recap-server");

    let server_config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();

    // Durable state: Redis in production, in-memory for local development.
    let backend = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
    let (store, ledger): (Arc<dyn JobStore>, Arc<dyn QuotaLedger>) = match backend.as_str() {
        "redis" => {
            let redis_config = RedisStoreConfig::from_env();
            let store = match RedisJobStore::new(redis_config.clone()) {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to create Redis job store: {e}");
                    std::process::exit(1);
                }
            };
            let ledger = match RedisLedger::new(redis_config) {
                Ok(ledger) => ledger,
                Err(e) => {
                    error!("Failed to create Redis ledger: {e}");
                    std::process::exit(1);
                }
            };
            (Arc::new(store), Arc::new(ledger))
        }
        _ => {
            warn!("STORE_BACKEND=memory: job state will not survive restarts");
            (
                Arc::new(MemoryJobStore::new()),
                Arc::new(MemoryLedger::new()),
            )
        }
    };

    let blobs: Arc<dyn BlobStore> = if std::env::var("BLOB_ENDPOINT_URL").is_ok() {
        match S3BlobStore::from_env().await {
            Ok(blobs) => Arc::new(blobs),
            Err(e) => {
                error!("Failed to create blob store client: {e}");
                std::process::exit(1);
            }
        }
    } else {
        warn!("BLOB_ENDPOINT_URL not set: using in-memory blob store");
        Arc::new(MemoryBlobStore::new(&server_config.media_bucket))
    };

    let billing: Arc<dyn BillingSink> = match HttpProviderConfig::from_env("BILLING_WEBHOOK") {
        Some(config) => Arc::new(WebhookBillingSink::new(config)),
        None => Arc::new(LogBillingSink),
    };

    let providers = ProviderSet {
        chapters: Arc::new(HttpChapterProvider::new(required_provider(
            "CHAPTERS_PROVIDER",
        ))),
        describer: Arc::new(HttpVisualDescriber::new(required_provider(
            "VISION_PROVIDER",
        ))),
        synthesizer: Arc::new(HttpSpeechSynthesizer::new(required_provider(
            "TTS_PROVIDER",
        ))),
        transcoder: Arc::new(HttpMediaTranscoder::new(required_provider("TRANSCODER"))),
        billing,
    };

    let deps = Arc::new(EngineDeps {
        store: store.clone(),
        ledger: ledger.clone(),
        blobs: blobs.clone(),
        gate: Arc::new(CallGate::new(engine_config.providers.clone())),
        bus: Arc::new(ProgressBus::new()),
        providers,
    });

    let controller = Arc::new(PipelineController::new(deps.clone(), engine_config));
    let controller_task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Controller error: {e}");
            }
        })
    };

    let state = AppState {
        store,
        ledger,
        blobs,
        bus: deps.bus.clone(),
        controller: controller.clone(),
        config: server_config.clone(),
    };

    let listener = match tokio::net::TcpListener::bind(&server_config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", server_config.bind_addr);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", server_config.bind_addr);

    let app = build_router(state);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    });

    if let Err(e) = serve.await {
        error!("Server error: {e}");
    }

    controller.shutdown();
    controller_task.await.ok();
    info!("Server shutdown complete");
}
