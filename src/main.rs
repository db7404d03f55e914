use dotenvy::dotenv;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use studioserver::api_router;
use studioserver::config::AppConfig;
use studioserver::shared::state::AppState;
use studioserver::shared::utils::create_conn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env()?;

    let pool = create_conn(&config.database.url)?;

    let cache = match &config.cache.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Redis unavailable, prefetch cache disabled: {e}");
                None
            }
        },
        None => None,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(pool, cache, config));

    let app = axum::Router::new()
        .merge(api_router::configure_api_routes())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("studioserver listening on {addr}");
    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
