use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Durable document record without its binary state. The id is assigned at
/// creation and never regenerated; it is the join key between the store and
/// the live room.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: Uuid,
    pub title: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMeta {
    /// The authorization rule: caller is owner or in the collaborator set.
    pub fn allows(&self, user: &str) -> bool {
        self.owner == user || self.collaborators.iter().any(|c| c == user)
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    /// Client-chosen id (the editor creates the id up front so the room url
    /// is known before the record exists); generated when absent.
    pub id: Option<Uuid>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareDocumentRequest {
    /// Identity to add to the collaborator set.
    pub user: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareDocumentResponse {
    pub message: String,
    pub user: String,
}
