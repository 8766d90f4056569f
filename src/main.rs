use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use dealerbot::bot::{BotEngine, PendingQueues};
use dealerbot::config::Config;
use dealerbot::llm::Client as LlmClient;
use dealerbot::service::BotService;
use dealerbot::store::{SqliteStore, TenantStore};
use dealerbot::whatsapp::bridge::BridgeFactory;
use dealerbot::whatsapp::{ConnectionManager, PairResult, SessionEvent};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "dealerbot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("dealerbot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting dealerbot...");
    info!("Loaded config from {config_path}");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open database {:?}: {}", config.database_path, e);
            std::process::exit(1);
        }
    };

    let provider = Arc::new(LlmClient::new(
        config.llm_api_key.clone(),
        config.llm_endpoint.clone(),
        config.llm_model.clone(),
    ));
    let factory = Arc::new(BridgeFactory::new(&config.bridge_url, config.bridge_poll_interval));
    let manager = ConnectionManager::new(factory, config.manager_options());

    let pending = Arc::new(PendingQueues::new(config.max_pending_photos, config.pending_upload_ttl));
    let _sweeper = pending.spawn_sweeper(SWEEP_INTERVAL);

    let engine = Arc::new(BotEngine::new(
        provider,
        store.clone(),
        store.clone(),
        store.clone(),
        pending,
        config.engine_options(),
    ));
    let service = Arc::new(BotService::new(
        engine,
        manager.clone(),
        store.clone(),
        store.clone(),
        config.addressing.clone(),
    ));
    manager.set_message_handler(service);

    // Record pairing transitions
    let mut events = manager.subscribe();
    let tenants_store = store.clone();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} session event(s)", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let (tenant, status, phone) = match &event {
                SessionEvent::Paired { tenant, phone } => (*tenant, "paired", Some(phone.as_str())),
                SessionEvent::PairingFailed { tenant } => (*tenant, "unpaired", None),
                SessionEvent::Disconnected { tenant } => (*tenant, "disconnected", None),
            };
            if let Err(e) = tenants_store.record_pairing(tenant, status, phone).await {
                warn!("Failed to record pairing status for tenant {}: {}", tenant, e);
            }
        }
    });

    for &tenant in &config.tenants {
        match manager.pair_tenant(tenant).await {
            Ok(PairResult::QrGenerated { .. }) => {
                info!("📱 Tenant {} waiting for QR scan ({:?})", tenant, manager.qr_image_path(tenant).await)
            }
            Ok(result) => info!("Tenant {}: {:?}", tenant, result),
            Err(e) => error!("Failed to start pairing for tenant {}: {}", tenant, e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
    manager.shutdown().await;
}
