use axum::Router;
use axum::routing::get;
use masquerade::config::Config;
use masquerade::store::Store;
use masquerade::{AppState, rooms};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,masquerade=debug")),
        )
        .init();

    let config = Config::from_env();
    info!(?config, "starting lobby server");

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    let store = Store::new(db_pool);
    store.migrate().await?;

    let state = AppState::new(store);
    let app = Router::new()
        .route("/ws", get(rooms::ws::lobby_ws))
        .nest("/api/rooms", rooms::router())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
