use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingest_hub::config::Config;
use ingest_hub::events::EventBus;
use ingest_hub::manager::IngestionManager;
use ingest_hub::plugin::PluginRegistry;
use ingest_hub::provider::HttpWebhookProvider;
use ingest_hub::routes::{self, AppState};
use ingest_hub::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_hub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("Error: Failed to load configuration: {}", e);
            eprintln!("\nOptional environment variables:");
            eprintln!("  LISTEN_ADDR            - Address to bind (default: 0.0.0.0:3000)");
            eprintln!("  DATABASE_PATH          - SQLite path (default: in-memory store)");
            eprintln!("  GITHUB_API_URL         - GitHub API base for hook registration");
            eprintln!("  DRIVE_API_URL          - Google APIs base for Drive watches");
            eprintln!("  PROVIDER_TIMEOUT_SECS  - Provider call timeout (default: 15)");
            eprintln!("  CRON_WINDOW_SECS       - Cron due-time tolerance (default: 65)");
            eprintln!("  EVENT_LOG              - Log lifecycle events at info (default: true)");
            std::process::exit(1);
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        database_path = %config.database_path,
        cron_window_secs = config.cron_window_secs,
        "Starting ingest-hub"
    );

    // Pick the store: SQLite when a path is configured, in-memory otherwise
    let store: Arc<dyn Store> = if config.database_path.is_empty() {
        info!("No DATABASE_PATH set; task state is in-memory and lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        match SqliteStore::open(&config.database_path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, path = %config.database_path, "Failed to open database");
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.database_path, e
                );
                std::process::exit(1);
            }
        }
    };

    let provider = match HttpWebhookProvider::new(
        config.github_api_url.clone(),
        config.drive_api_url.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    ) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            error!(error = %e, "Failed to build webhook provider");
            eprintln!("Error: Failed to build webhook provider: {}", e);
            std::process::exit(1);
        }
    };

    // Crawler and destination plugins register here at startup; the control
    // plane itself ships none.
    let registry = Arc::new(PluginRegistry::new());

    let events = Arc::new(EventBus::new());
    if config.event_log {
        events.subscribe(|event| {
            info!(task_id = %event.task_id(), event = ?event, "lifecycle event");
        });
    }

    let manager = IngestionManager::new(store, provider, registry, events)
        .with_cron_window(config.cron_window_secs);

    let app_state = Arc::new(AppState { manager });
    let app = routes::router(app_state);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind to address");

    info!(address = %config.listen_addr, "Server listening");
    info!("Webhook ingress: http://<your-host>/hooks/:endpoint_id");
    info!("Cron tick: POST http://<your-host>/cron/tick");
    info!("Task API: http://<your-host>/tasks");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
