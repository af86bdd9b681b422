use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::diagnostics::diagnostics;
use crate::handlers::documents::{
    create_document, get_document, list_documents, share_document,
};
use crate::handlers::health::{health_check, ready_check};
use crate::routes::auth_middleware::auth_middleware;
use crate::AppState;

/// Create API routes
pub fn create_api_routes(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/documents", get(list_documents).post(create_document))
        .route("/v1/documents/:doc_id", get(get_document))
        .route("/v1/documents/:doc_id/share", post(share_document))
        .route("/v1/diagnostics", get(diagnostics))
        // Applies to all routes added above
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth_middleware,
        ))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(app_state)
}
