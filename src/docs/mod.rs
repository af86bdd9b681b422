use crate::models::*;
use utoipa::OpenApi;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// List the caller's documents
#[utoipa::path(
    get,
    path = "/api/v1/documents",
    responses(
        (status = 200, description = "Documents owned by or shared with the caller", body = [DocumentMeta]),
        (status = 401, description = "Missing or invalid credential", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn list_documents_doc() {}

/// Register a new document
#[utoipa::path(
    post,
    path = "/api/v1/documents",
    request_body = CreateDocumentRequest,
    responses(
        (status = 201, description = "Document created", body = DocumentMeta),
        (status = 400, description = "Document id already exists", body = ErrorResponse),
        (status = 401, description = "Missing or invalid credential", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn create_document_doc() {}

/// Fetch document metadata
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}",
    params(
        ("doc_id" = uuid::Uuid, Path, description = "Document id")
    ),
    responses(
        (status = 200, description = "Document metadata", body = DocumentMeta),
        (status = 403, description = "Caller has no access", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn get_document_doc() {}

/// Share a document with another user
#[utoipa::path(
    post,
    path = "/api/v1/documents/{doc_id}/share",
    params(
        ("doc_id" = uuid::Uuid, Path, description = "Document id")
    ),
    request_body = ShareDocumentRequest,
    responses(
        (status = 200, description = "Collaborator added", body = ShareDocumentResponse),
        (status = 400, description = "Already a collaborator", body = ErrorResponse),
        (status = 403, description = "Caller is not the owner", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn share_document_doc() {}

/// Server diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Registry counters and system load", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid credential", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        list_documents_doc,
        create_document_doc,
        get_document_doc,
        share_document_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            DocumentMeta,
            CreateDocumentRequest,
            ShareDocumentRequest,
            ShareDocumentResponse,
            DiagnosticsResponse,
            ErrorResponse
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
