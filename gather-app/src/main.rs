//! gather-app — enrollment service harness.
//!
//! Wires the store, registry, engine and supervisor together and runs until
//! ctrl-c. Ships with a dry-run client factory that logs intended network
//! actions instead of performing them; swap in a real factory to go live.
//!
//! Environment:
//!   GATHER_DATA_DIR      state directory (default ./data)
//!   GATHER_SESSIONS_DIR  credential files (default <data>/sessions)
//!   RUST_LOG             log filter (default gather=info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use gather_client::ClientFactory;
use gather_core::{
    Engine, QrConfig, QrManager, Registry, SessionDirs, Supervisor, SupervisorConfig,
};
use gather_store::Store;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);
const QR_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

mod dry_run;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("gather-app: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gather=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = PathBuf::from(
        std::env::var("GATHER_DATA_DIR").unwrap_or_else(|_| "./data".into()),
    );
    let sessions_dir = std::env::var("GATHER_SESSIONS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("sessions"));
    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(Store::open(data_dir.join("gather.db"))?);
    let dirs = SessionDirs::new(&sessions_dir);
    dirs.ensure()?;

    let factory: Arc<dyn ClientFactory> = Arc::new(dry_run::DryRunFactory::default());
    let registry = Arc::new(Registry::new(Arc::clone(&store), Arc::clone(&factory), dirs));
    let loaded = registry.load_all().await?;
    info!(loaded, db = %data_dir.join("gather.db").display(), "service initialized");

    Arc::clone(&registry).spawn_health_check(HEALTH_CHECK_INTERVAL);
    let qr = QrManager::new(
        Arc::clone(&store),
        factory,
        Arc::clone(&registry),
        QrConfig::default(),
    );
    qr.spawn_janitor(QR_JANITOR_INTERVAL);

    let engine = Arc::new(Engine::new(Arc::clone(&store), Arc::clone(&registry)));
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        engine,
        SupervisorConfig::default(),
    ));
    supervisor.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    supervisor.stop().await;
    Ok(())
}
