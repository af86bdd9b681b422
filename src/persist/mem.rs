use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::DocumentMeta;
use crate::persist::store::PersistError;

struct StoredDoc {
    meta: DocumentMeta,
    state: Option<Vec<u8>>,
}

/// In-memory document store: the degraded mode when no database is
/// configured, and the Postgres stand-in for tests.
#[derive(Default)]
pub struct MemStore {
    docs: Mutex<HashMap<Uuid, StoredDoc>>,
    fail_saves: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save_state` calls fail, to exercise retry paths.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn load_state(&self, id: Uuid) -> Result<Option<Vec<u8>>, PersistError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(&id).and_then(|d| d.state.clone()))
    }

    pub async fn save_state(&self, id: Uuid, snapshot: &[u8]) -> Result<(), PersistError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("save failure injected".into()));
        }
        let mut docs = self.docs.lock().await;
        let now = Utc::now();
        match docs.get_mut(&id) {
            Some(doc) => {
                doc.state = Some(snapshot.to_vec());
                doc.meta.updated_at = now;
            }
            None => {
                // Upsert semantics, matching the durable store.
                docs.insert(
                    id,
                    StoredDoc {
                        meta: DocumentMeta {
                            id,
                            title: "Untitled Document".to_string(),
                            owner: String::new(),
                            collaborators: Vec::new(),
                            created_at: now,
                            updated_at: now,
                        },
                        state: Some(snapshot.to_vec()),
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<DocumentMeta>, PersistError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(&id).map(|d| d.meta.clone()))
    }

    pub async fn list_for(&self, user: &str) -> Result<Vec<DocumentMeta>, PersistError> {
        let docs = self.docs.lock().await;
        let mut out: Vec<DocumentMeta> = docs
            .values()
            .filter(|d| d.meta.allows(user))
            .map(|d| d.meta.clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub async fn create(
        &self,
        id: Uuid,
        title: &str,
        owner: &str,
    ) -> Result<DocumentMeta, PersistError> {
        let mut docs = self.docs.lock().await;
        let now = Utc::now();
        let meta = DocumentMeta {
            id,
            title: title.to_string(),
            owner: owner.to_string(),
            collaborators: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        docs.insert(id, StoredDoc { meta: meta.clone(), state: None });
        Ok(meta)
    }

    pub async fn add_collaborator(&self, id: Uuid, user: &str) -> Result<(), PersistError> {
        let mut docs = self.docs.lock().await;
        if let Some(doc) = docs.get_mut(&id) {
            if !doc.meta.collaborators.iter().any(|c| c == user) {
                doc.meta.collaborators.push(user.to_string());
                doc.meta.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}
