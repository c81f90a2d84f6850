use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod prices;
mod routes;
mod scheduler;
mod sensors;
mod template;
mod utils;

use config::Config;
use prices::connector::{FetchMode, TgeClient};
use prices::store::{PriceCache, StatePersistence};
use routes::{create_router, AppState};
use scheduler::{spawn_scheduler, UpdateCoordinator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tge_prices_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let client = TgeClient::new(config.fetch_mode.clone(), config.zone, config.http_timeout)?;
    match client.mode() {
        FetchMode::Dated { url_template } => {
            tracing::info!("Fetching dated pages from {}", url_template)
        }
        FetchMode::Current { url } => tracing::info!("Fetching current page from {}", url),
    }

    // Restore cached days from the last run
    let persistence = StatePersistence::new(&config.state_path);
    let cache = match persistence.load() {
        Ok(Some(state)) => {
            let cache = PriceCache::restore(state);
            tracing::info!(
                "Restored {:?} from {}",
                cache.dates(),
                persistence.path().display()
            );
            cache
        }
        Ok(None) => PriceCache::new(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable state file: {:#}", e);
            PriceCache::new()
        }
    };

    let coordinator = Arc::new(UpdateCoordinator::new(
        client,
        config.templates.clone(),
        Some(persistence),
        cache,
    ));
    spawn_scheduler(Arc::clone(&coordinator), config.zone, config.poll_interval);

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        coordinator,
    };

    let app = create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server starting on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
