use moka::sync::Cache;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::AppError;
use crate::persist::DocStore;
use crate::services::auth_service::validate_jwt;

/// Stable identity extracted from a validated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
}

/// Authentication and authorization in front of every room join and API
/// call. Authorization results are cached briefly so a busy room does not
/// hammer the registry.
pub struct AccessGate {
    store: DocStore,
    jwt_secret: Option<String>,
    perm_cache: Cache<(Uuid, String), bool>,
}

impl AccessGate {
    pub fn new(store: DocStore, jwt_secret: Option<String>) -> Self {
        Self {
            store,
            jwt_secret,
            perm_cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(30))
                .build(),
        }
    }

    /// Validate a bearer credential and return the caller's identity.
    pub fn authenticate(&self, token: &str) -> Result<Identity, AppError> {
        let secret = self.jwt_secret.as_ref().ok_or_else(|| {
            error!("Auth JWT secret not configured");
            AppError::Auth("Authentication is not configured".to_string())
        })?;

        let token_data = validate_jwt(token, secret)
            .map_err(|e| AppError::Auth(format!("JWT validation failed: {}", e)))?;

        let user_id = token_data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Auth("JWT token does not contain 'sub' claim".to_string()))?
            .to_string();
        let name = token_data
            .claims
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&user_id)
            .to_string();

        Ok(Identity { user_id, name })
    }

    /// Check the owner-or-collaborator rule for a document. Runs before any
    /// room state is touched, so a rejected caller never causes a room to be
    /// created.
    pub async fn authorize(&self, identity: &Identity, doc_id: Uuid) -> Result<(), AppError> {
        let key = (doc_id, identity.user_id.clone());
        if let Some(allowed) = self.perm_cache.get(&key) {
            return if allowed {
                Ok(())
            } else {
                Err(AppError::Permission(format!(
                    "User '{}' has no access to document '{}'",
                    identity.user_id, doc_id
                )))
            };
        }

        let meta = self
            .store
            .fetch(doc_id)
            .await
            .map_err(|e| {
                error!("Failed to look up document '{}': {}", doc_id, e);
                AppError::Persistence(format!("Document lookup failed: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(format!("Document '{}' not found", doc_id)))?;

        let allowed = meta.allows(&identity.user_id);
        self.perm_cache.insert(key, allowed);
        if allowed {
            Ok(())
        } else {
            info!(
                "Denying user '{}' access to document '{}'",
                identity.user_id, doc_id
            );
            Err(AppError::Permission(format!(
                "User '{}' has no access to document '{}'",
                identity.user_id, doc_id
            )))
        }
    }

    /// Drop any cached decision for a document, e.g. after sharing it.
    pub fn invalidate(&self, doc_id: Uuid, user: &str) {
        self.perm_cache.invalidate(&(doc_id, user.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::mem::MemStore;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::Arc;

    const SECRET: &str = "test-secret";

    fn token_for(user: &str) -> String {
        let claims = json!({
            "sub": user,
            "name": user,
            "exp": 4_102_444_800u64,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn gate_with_store() -> (AccessGate, DocStore) {
        let store = DocStore::Mem(Arc::new(MemStore::new()));
        let gate = AccessGate::new(store.clone(), Some(SECRET.to_string()));
        (gate, store)
    }

    #[tokio::test]
    async fn authenticate_accepts_valid_token() {
        let (gate, _) = gate_with_store();
        let identity = gate.authenticate(&token_for("alice")).unwrap();
        assert_eq!(identity.user_id, "alice");
    }

    #[tokio::test]
    async fn authenticate_rejects_garbage_and_wrong_secret() {
        let (gate, _) = gate_with_store();
        assert!(matches!(
            gate.authenticate("not-a-jwt"),
            Err(AppError::Auth(_))
        ));

        let forged = encode(
            &Header::default(),
            &json!({"sub": "mallory", "exp": 4_102_444_800u64}),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert!(matches!(gate.authenticate(&forged), Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn authorize_owner_collaborator_and_outsider() {
        let (gate, store) = gate_with_store();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();
        store.add_collaborator(doc_id, "carol").await.unwrap();

        let alice = Identity { user_id: "alice".into(), name: "alice".into() };
        let carol = Identity { user_id: "carol".into(), name: "carol".into() };
        let bob = Identity { user_id: "bob".into(), name: "bob".into() };

        assert!(gate.authorize(&alice, doc_id).await.is_ok());
        assert!(gate.authorize(&carol, doc_id).await.is_ok());
        assert!(matches!(
            gate.authorize(&bob, doc_id).await,
            Err(AppError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn authorize_unknown_document_is_not_found() {
        let (gate, _) = gate_with_store();
        let nobody = Identity { user_id: "bob".into(), name: "bob".into() };
        assert!(matches!(
            gate.authorize(&nobody, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn share_then_invalidate_refreshes_cached_denial() {
        let (gate, store) = gate_with_store();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let bob = Identity { user_id: "bob".into(), name: "bob".into() };
        assert!(gate.authorize(&bob, doc_id).await.is_err());

        store.add_collaborator(doc_id, "bob").await.unwrap();
        // Still denied from cache until invalidated.
        assert!(gate.authorize(&bob, doc_id).await.is_err());
        gate.invalidate(doc_id, "bob");
        assert!(gate.authorize(&bob, doc_id).await.is_ok());
    }
}
