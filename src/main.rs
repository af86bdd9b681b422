mod auth;
mod config;
mod docs;
mod engine;
mod handlers;
mod models;
mod persist;
mod room;
mod routes;
mod services;
mod ws;

use std::panic;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use auth::AccessGate;
use config::Config;
use docs::ApiDoc;
use persist::mem::MemStore;
use persist::pg::PgStore;
use persist::DocStore;
use room::RoomRegistry;
use routes::create_api_routes;
use ws::handler::websocket_handler;

/// Shared state behind every HTTP handler and websocket session.
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub store: DocStore,
    pub gate: AccessGate,
}

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "collabwrite_doc=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    config::set_config(config);
    let config = config::get_config();

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - every request will be rejected");
    }

    // Initialize the document store
    let store = match &config.db_url {
        Some(db_url) => match PgStore::new(db_url).await {
            Ok(pg) => {
                info!("Database initialized successfully");
                DocStore::Pg(Arc::new(pg))
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to in-memory storage - documents will not survive a restart");
                DocStore::Mem(Arc::new(MemStore::new()))
            }
        },
        None => {
            warn!("No database URL configured - using in-memory storage");
            DocStore::Mem(Arc::new(MemStore::new()))
        }
    };

    let registry = RoomRegistry::new(store.clone(), config);
    let gate = AccessGate::new(store.clone(), config.auth_jwt_secret.clone());
    let app_state = Arc::new(AppState { registry, store, gate });

    // Create API routes
    let api_routes = create_api_routes(app_state.clone());

    // CORS: explicit origins when configured, otherwise wide open (dev)
    let cors = match &config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    // Combine all routes
    let app_routes = Router::new()
        // Mount API routes
        .nest("/api", api_routes)
        // Mount the websocket endpoint
        .route(
            "/ws/:doc_id",
            get(websocket_handler).with_state(app_state.clone()),
        )
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start the server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!(
        "📡 WebSocket available at ws://{}/ws/:doc_id",
        config.server_address()
    );
    info!(
        "📚 Swagger UI available at http://{}/swagger",
        config.server_address()
    );

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
