use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::models::AppError;
use crate::services::auth_service::get_auth_token;
use crate::AppState;

/// Validate the caller's credential and stash the resulting identity in the
/// request extensions for downstream handlers.
pub async fn auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 1. Get the auth token from the request
    let token = get_auth_token(req.headers(), req.uri().query()).map_err(AppError::Auth)?;

    // 2. Validate it and resolve the identity
    let identity = app_state.gate.authenticate(&token)?;
    debug!("Authenticated user '{}'", identity.user_id);

    // 3. Make the identity available to handlers
    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}
