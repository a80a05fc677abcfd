mod adapters;
mod api;
mod config;
mod db;
mod download;
mod error;
mod events;
mod library;
mod metadata;
mod monitor;
mod printers;
mod transfer;
mod watcher;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adapters::camera::SnapshotGateway;
use crate::adapters::mqtt_discovery::DiscoveryPublisher;
use crate::adapters::webhooks::WebhookNotifier;
use crate::config::Config;
use crate::events::EventBus;
use crate::library::LibraryService;
use crate::metadata::{ExtractionQueue, MetadataService};
use crate::monitor::MonitoringScheduler;
use crate::printers::PrinterManager;
use crate::transfer::FileTransferService;

/// Overall shutdown budget; outstanding tasks are abandoned past it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-driver disconnect grace.
const DRIVER_STOP_GRACE: Duration = Duration::from_secs(5);
/// Printer subsystem shutdown budget.
const PRINTER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
/// Metadata worker drain grace.
const METADATA_DRAIN_GRACE: Duration = Duration::from_secs(15);

/// Shared application state
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub printers: Arc<PrinterManager>,
    pub scheduler: Arc<MonitoringScheduler>,
    pub library: Arc<LibraryService>,
    pub transfers: Arc<FileTransferService>,
    pub discovery: Option<Arc<DiscoveryPublisher>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "printernizer_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Connect to database and run migrations
    let db = db::connect(&config.database_url).await?;
    db::migrate(&db).await?;

    // Event bus couples everything below to the outward adapters.
    let bus = EventBus::new();

    // Library + metadata pipeline.
    let (extraction_queue, extraction_rx) = ExtractionQueue::new(256);
    let library = LibraryService::new(db.clone(), Arc::clone(&bus), &config, extraction_queue);
    library.initialize().await?;
    let metadata = MetadataService::start(
        db.clone(),
        Arc::clone(&bus),
        extraction_rx,
        config.library_processing_workers,
    );

    // Printer drivers and monitoring.
    let snapshots = SnapshotGateway::new();
    let printer_manager = PrinterManager::new(
        Arc::clone(&bus),
        db.clone(),
        config.clone(),
        Arc::clone(&snapshots),
    );
    for row in db::printers::list(&db).await? {
        if let Err(e) = printer_manager.register(&row).await {
            tracing::error!(printer_id = %row.id, error = %e, "driver registration failed");
        }
    }
    let scheduler = MonitoringScheduler::new(Arc::clone(&printer_manager), config.clone());
    scheduler.start().await;

    let transfers = FileTransferService::new(db.clone(), Arc::clone(&library), config.clone());

    // Outward adapters.
    let discovery = if config.enable_mqtt_discovery {
        let publisher = DiscoveryPublisher::start(&config, Arc::clone(&bus)).await?;
        for row in db::printers::list(&db).await? {
            publisher.publish_printer(&row).await;
        }
        Some(publisher)
    } else {
        None
    };
    let notifier = WebhookNotifier::start(&config, Arc::clone(&bus), db.clone());
    let watch_folders =
        watcher::WatchFolderService::start(&config.watch_folders, Arc::clone(&library));

    // Create shared state
    let state = Arc::new(AppState {
        db: db.clone(),
        config: config.clone(),
        bus,
        printers: Arc::clone(&printer_manager),
        scheduler: Arc::clone(&scheduler),
        library,
        transfers,
        discovery: discovery.clone(),
    });

    // Build router
    let app = Router::new()
        .nest("/api", api::router())
        .nest("/ws", websocket::router())
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("printernizer server listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Ordered teardown: scheduler first (no new polls), then drivers,
    // then the metadata drain, then outward adapters, storage last.
    tracing::info!("shutting down");
    let teardown = async {
        scheduler.shutdown().await;
        let _ = tokio::time::timeout(
            PRINTER_SHUTDOWN_TIMEOUT,
            printer_manager.shutdown(DRIVER_STOP_GRACE),
        )
        .await;
        metadata.shutdown(METADATA_DRAIN_GRACE).await;
        if let Some(watch) = watch_folders {
            watch.shutdown();
        }
        if let Some(notifier) = notifier {
            notifier.shutdown().await;
        }
        if let Some(discovery) = &discovery {
            discovery.shutdown().await;
        }
        db.close().await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
        tracing::warn!("shutdown budget exceeded, abandoning outstanding tasks");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
}
