use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fluxwatch::audit::JsonlAuditSink;
use fluxwatch::cloud::rest::{RestClientSettings, RestCloudClient};
use fluxwatch::monitor::{EngineContext, MonitorScheduler};
use fluxwatch::notifications::senders::webhook::WebhookSender;
use fluxwatch::notifications::NotificationService;
use fluxwatch::policy::{ConfigStore, MemoryConfigStore, PolicyResolver};
use fluxwatch::server::config::ServerConfig;
use fluxwatch::shutdown::{OrchestratorSettings, ShutdownOrchestrator};
use fluxwatch::version::VERSION;
use fluxwatch::web::create_axum_router;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "fluxwatch.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Manually check for --version before full parsing to keep the output simple.
    if std::env::args().any(|arg| arg == "--version") {
        println!("fluxwatch version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();
    dotenv().ok();

    // --- Server Config Setup ---
    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&server_config.log_dir);
    info!("Starting fluxwatch, version: {}", VERSION);

    // --- Config Store Setup ---
    let store = match MemoryConfigStore::load_file(Path::new(&server_config.accounts_file)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to load accounts file.");
            return Err(e.into());
        }
    };
    // A missing global config is fatal at process start: nothing can be
    // scheduled without it.
    if store.global_config().await?.is_none() {
        error!("Accounts file carries no global configuration section.");
        return Err("global configuration is missing".into());
    }
    let account_count = store.list_accounts().await?.len();
    info!(account_count, "Config store loaded.");

    // --- Cloud Client Setup ---
    let cloud = Arc::new(RestCloudClient::new(RestClientSettings {
        endpoint_template: server_config.provider_endpoint.clone(),
        request_timeout: Duration::from_secs(server_config.request_timeout_secs),
    })?);

    // --- Audit Sink Setup ---
    let audit = match JsonlAuditSink::open(Path::new(&server_config.audit_log_path)) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, path = %server_config.audit_log_path, "Failed to open audit log.");
            return Err(e.into());
        }
    };

    // --- Engine Setup ---
    let notifier = Arc::new(NotificationService::new(
        Arc::new(WebhookSender::new()),
        audit.clone(),
    ));
    let resolver = Arc::new(PolicyResolver::new(store.clone()));
    let orchestrator = ShutdownOrchestrator::new(
        cloud.clone(),
        store.clone(),
        resolver,
        audit.clone(),
        notifier.clone(),
        OrchestratorSettings::default(),
    );
    let ctx = EngineContext::new(
        store.clone(),
        cloud,
        audit,
        notifier,
        orchestrator,
    );

    let scheduler = MonitorScheduler::new(ctx);
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    // --- Axum HTTP Server Setup ---
    let addr: SocketAddr = server_config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "HTTP server listening.");

    let app = create_axum_router(scheduler.clone(), store.clone());

    let shutdown_scheduler = scheduler.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal.");
                return;
            }
            info!("Shutdown signal received, cancelling monitor tasks.");
            shutdown_scheduler.shutdown();
        })
        .await?;

    scheduler.shutdown();
    let _ = scheduler_task.await;
    info!("Server stopped.");

    Ok(())
}
