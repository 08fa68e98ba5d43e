mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::state::{AppState, AppStateInner};
use parley_gateway::{Gateway, IdentityVerifier, JwtVerifier, SqliteStore, connection};

use crate::config::ServerConfig;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = parley_db::Database::open(&config.db_path)?;
    info!("Database ready at {}", config.db_path.display());

    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let gateway = Gateway::new(
        Arc::new(SqliteStore::new(db)),
        verifier.clone(),
        config.gateway.clone(),
    );

    let app_state: AppState = Arc::new(AppStateInner {
        gateway: gateway.clone(),
        verifier,
    });

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(parley_api::protected_routes(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The token may ride on the upgrade URL; otherwise the client sends an
/// `Identify` frame first.
async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway, query.token))
}
