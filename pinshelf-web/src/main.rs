//! pinshelf-web - Self-hosted image gallery service

use anyhow::Result;
use clap::Parser;
use tracing::info;

use pinshelf_web::config::{load_settings, Cli};
use pinshelf_web::object_store::ObjectStore;
use pinshelf_web::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting pinshelf-web v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    info!("Database path: {}", settings.database_path.display());

    let pool = pinshelf_common::db::init_database(&settings.database_path).await?;
    let store = ObjectStore::new(&settings.object_store).await?;

    let state = AppState::new(pool, store);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("pinshelf-web listening on http://{}", settings.bind_addr);
    info!("Health check: http://{}/health", settings.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
