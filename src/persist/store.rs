use std::sync::Arc;
use uuid::Uuid;

use crate::models::DocumentMeta;
use crate::persist::mem::MemStore;
use crate::persist::pg::PgStore;

/// Storage I/O failure. Always recovered by callers: logged and retried,
/// never surfaced into an editing session.
#[derive(Debug)]
pub enum PersistError {
    Db(sqlx::Error),
    Unavailable(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Db(e) => write!(f, "Database error: {}", e),
            PersistError::Unavailable(m) => write!(f, "Store unavailable: {}", m),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<sqlx::Error> for PersistError {
    fn from(e: sqlx::Error) -> Self {
        PersistError::Db(e)
    }
}

/// The document registry and snapshot store behind the persistence bridge.
///
/// Cheap to clone; one instance is shared by the room registry, the access
/// gate and the HTTP handlers.
#[derive(Clone)]
pub enum DocStore {
    Pg(Arc<PgStore>),
    Mem(Arc<MemStore>),
}

impl DocStore {
    /// Fetch a document's stored snapshot. Absence is not an error: a
    /// document that was created but never flushed is simply empty.
    pub async fn load_state(&self, id: Uuid) -> Result<Option<Vec<u8>>, PersistError> {
        match self {
            DocStore::Pg(s) => s.load_state(id).await,
            DocStore::Mem(s) => s.load_state(id).await,
        }
    }

    /// Upsert a document's snapshot and refresh `updated_at`.
    pub async fn save_state(&self, id: Uuid, snapshot: &[u8]) -> Result<(), PersistError> {
        match self {
            DocStore::Pg(s) => s.save_state(id, snapshot).await,
            DocStore::Mem(s) => s.save_state(id, snapshot).await,
        }
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<DocumentMeta>, PersistError> {
        match self {
            DocStore::Pg(s) => s.fetch(id).await,
            DocStore::Mem(s) => s.fetch(id).await,
        }
    }

    /// Documents the user owns or collaborates on, most recently updated
    /// first.
    pub async fn list_for(&self, user: &str) -> Result<Vec<DocumentMeta>, PersistError> {
        match self {
            DocStore::Pg(s) => s.list_for(user).await,
            DocStore::Mem(s) => s.list_for(user).await,
        }
    }

    pub async fn create(
        &self,
        id: Uuid,
        title: &str,
        owner: &str,
    ) -> Result<DocumentMeta, PersistError> {
        match self {
            DocStore::Pg(s) => s.create(id, title, owner).await,
            DocStore::Mem(s) => s.create(id, title, owner).await,
        }
    }

    pub async fn add_collaborator(&self, id: Uuid, user: &str) -> Result<(), PersistError> {
        match self {
            DocStore::Pg(s) => s.add_collaborator(id, user).await,
            DocStore::Mem(s) => s.add_collaborator(id, user).await,
        }
    }
}
