use std::sync::Arc;

use bpmn_lite_core::engine::Engine;
use bpmn_lite_core::store::ProcessStore;
use bpmn_lite_core::store_memory::MemoryStore;
use bpmn_lite_core::SystemConfig;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = SystemConfig::from_env()?;
    let port = config.port;

    let database_url = parse_database_url();
    let store: Arc<dyn ProcessStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = bpmn_lite_core::store_postgres::PostgresProcessStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresProcessStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL set but the postgres feature is not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no DATABASE_URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let models_dir = config.models_dir.clone();
    let engine = Arc::new(Engine::with_store(config, store)?);
    let loaded = engine.load_models().await?;
    tracing::info!(models_dir, loaded, "loaded BPMN models");

    let app = bpmn_lite_server::http::router(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("bpmn-lite HTTP server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// `--database-url <url>` CLI arg takes precedence over `DATABASE_URL`.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
