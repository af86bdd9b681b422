use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::{
    AppError, CreateDocumentRequest, DocumentMeta, ShareDocumentRequest, ShareDocumentResponse,
};
use crate::AppState;

fn persistence(context: &str, e: impl std::fmt::Display) -> AppError {
    error!("{}: {}", context, e);
    AppError::Persistence(format!("{}: {}", context, e))
}

/// Documents the caller owns or collaborates on.
pub async fn list_documents(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<DocumentMeta>>, AppError> {
    let docs = app_state
        .store
        .list_for(&identity.user_id)
        .await
        .map_err(|e| persistence("Failed to list documents", e))?;
    Ok(Json(docs))
}

/// Register a new document. The editor may pick the id up front so the room
/// url is known before the record exists.
pub async fn create_document(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentMeta>), AppError> {
    let id = req.id.unwrap_or_else(Uuid::new_v4);
    let title = req.title.as_deref().unwrap_or("Untitled document");

    let existing = app_state
        .store
        .fetch(id)
        .await
        .map_err(|e| persistence("Failed to check for an existing document", e))?;
    if existing.is_some() {
        return Err(AppError::Protocol(format!(
            "Document '{}' already exists",
            id
        )));
    }

    let meta = app_state
        .store
        .create(id, title, &identity.user_id)
        .await
        .map_err(|e| persistence("Failed to create document", e))?;
    info!(
        "User '{}' created document {} ('{}')",
        identity.user_id, meta.id, meta.title
    );
    Ok((StatusCode::CREATED, Json(meta)))
}

/// Document metadata, for anyone with access.
pub async fn get_document(
    Path(doc_id): Path<Uuid>,
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<DocumentMeta>, AppError> {
    app_state.gate.authorize(&identity, doc_id).await?;
    let meta = app_state
        .store
        .fetch(doc_id)
        .await
        .map_err(|e| persistence("Failed to fetch document", e))?
        .ok_or_else(|| AppError::NotFound(format!("Document '{}' not found", doc_id)))?;
    Ok(Json(meta))
}

/// Add a collaborator. Owner only; the permission cache entry for the new
/// collaborator is invalidated so access applies immediately.
pub async fn share_document(
    Path(doc_id): Path<Uuid>,
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ShareDocumentRequest>,
) -> Result<Json<ShareDocumentResponse>, AppError> {
    let meta = app_state
        .store
        .fetch(doc_id)
        .await
        .map_err(|e| persistence("Failed to fetch document", e))?
        .ok_or_else(|| AppError::NotFound(format!("Document '{}' not found", doc_id)))?;

    if meta.owner != identity.user_id {
        return Err(AppError::Permission(
            "Only the owner can share a document".to_string(),
        ));
    }
    if req.user == meta.owner {
        return Err(AppError::Protocol(
            "The owner already has access".to_string(),
        ));
    }
    if meta.collaborators.iter().any(|c| *c == req.user) {
        return Err(AppError::Protocol(format!(
            "User '{}' is already a collaborator",
            req.user
        )));
    }

    app_state
        .store
        .add_collaborator(doc_id, &req.user)
        .await
        .map_err(|e| persistence("Failed to add collaborator", e))?;
    app_state.gate.invalidate(doc_id, &req.user);

    info!(
        "User '{}' shared document {} with '{}'",
        identity.user_id, doc_id, req.user
    );
    Ok(Json(ShareDocumentResponse {
        message: "Document shared".to_string(),
        user: req.user,
    }))
}
