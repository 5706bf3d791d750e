use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use depot_core::{NoopEmitter, Settings};
use depot_script::js::{JsPool, JsPoolConfig};
use depot_script::native::PluginCompiler;
use depot_security::TokenService;
use depot_server::{build_router, AppState, ResourceRegistry};
use depot_store::{Backend, FileBackend, MemoryBackend, SqliteBackend};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, clap::ValueEnum)]
enum BackendKind {
    /// Embedded in-memory store (nothing survives a restart).
    Memory,
    /// Embedded file store: one JSON blob per document.
    File,
    /// SQLite with one JSON-column table per collection.
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "depotd", about = "Self-hosted backend-as-a-service")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:2403")]
    listen: String,

    /// Directory of collection definitions.
    #[arg(long, default_value = "resources")]
    resources: PathBuf,

    /// Directory for runtime configuration (security.json).
    #[arg(long, default_value = ".config")]
    config: PathBuf,

    /// Directory for compiled native plugins.
    #[arg(long, default_value = ".plugins")]
    plugins: PathBuf,

    /// Store backend.
    #[arg(long, value_enum, default_value_t = BackendKind::File)]
    store: BackendKind,

    /// Data location: a directory (file store) or database path (sqlite).
    #[arg(long, default_value = "data")]
    data: String,

    /// Development mode: verbose errors, dev flag visible to hooks.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if args.dev { "debug" } else { "info" })
            }),
        )
        .init();

    let settings = Arc::new(Settings::load_or_init(&args.config)?);
    info!(
        master_key_prefix = settings.master_key_prefix(),
        "settings loaded"
    );

    let backend: Arc<dyn Backend> = match args.store {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::File => Arc::new(FileBackend::new(&args.data)),
        BackendKind::Sqlite => Arc::new(SqliteBackend::connect(&args.data).await?),
    };

    let js = Arc::new(JsPool::new(JsPoolConfig {
        sandbox_dir: Some(args.resources.clone()),
        ..JsPoolConfig::default()
    })?);
    let compiler = Arc::new(PluginCompiler::new(&args.plugins));

    let registry = Arc::new(ResourceRegistry::new(
        &args.resources,
        backend,
        js,
        compiler,
        Arc::new(NoopEmitter),
    ));
    registry.load_all().await?;
    // Dropping the watcher would stop hot reload; hold it for process life.
    let _watcher = Arc::clone(&registry).watch()?;

    let cancel = CancellationToken::new();
    let sweeper = depot_server::sweeper::start(
        Arc::clone(&registry),
        depot_server::sweeper::DEFAULT_INTERVAL,
        cancel.clone(),
    );

    let state = AppState {
        gateway: registry.gateway(),
        registry,
        tokens: Arc::new(TokenService::new(
            &settings.jwt_secret,
            settings.jwt_expiration(),
        )),
        settings,
        development: args.dev,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "depotd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    cancel.cancel();
    let _ = sweeper.await;
    Ok(())
}
