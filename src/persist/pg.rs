use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::models::DocumentMeta;
use crate::persist::store::PersistError;

/// Postgres-backed document store.
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    title: String,
    owner: String,
    collaborators: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentMeta {
    fn from(r: DocumentRow) -> Self {
        DocumentMeta {
            id: r.id,
            title: r.title,
            owner: r.owner,
            collaborators: r.collaborators,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl PgStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn new(database_url: &str) -> Result<Self, PersistError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL DEFAULT 'Untitled Document',
                state BYTEA,
                owner TEXT NOT NULL,
                collaborators TEXT[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, id: Uuid) -> Result<Option<Vec<u8>>, PersistError> {
        let row = sqlx::query("SELECT state FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let state: Option<Vec<u8>> = row.try_get("state")?;
                Ok(state)
            }
            None => Ok(None),
        }
    }

    /// Upsert: a flush must persist even when the registry row is missing,
    /// otherwise the caller clears its dirty flag over a zero-row update and
    /// the session's edits are gone.
    pub async fn save_state(&self, id: Uuid, snapshot: &[u8]) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, state, owner)
            VALUES ($1, $2, '')
            ON CONFLICT (id) DO UPDATE
            SET state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<DocumentMeta>, PersistError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, title, owner, collaborators, created_at, updated_at
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DocumentMeta::from))
    }

    pub async fn list_for(&self, user: &str) -> Result<Vec<DocumentMeta>, PersistError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, title, owner, collaborators, created_at, updated_at
            FROM documents
            WHERE owner = $1 OR $1 = ANY(collaborators)
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DocumentMeta::from).collect())
    }

    pub async fn create(
        &self,
        id: Uuid,
        title: &str,
        owner: &str,
    ) -> Result<DocumentMeta, PersistError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO documents (id, title, owner)
            VALUES ($1, $2, $3)
            RETURNING id, title, owner, collaborators, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;

        info!("Document created: {}", id);
        Ok(row.into())
    }

    pub async fn add_collaborator(&self, id: Uuid, user: &str) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            UPDATE documents
            SET collaborators = array_append(collaborators, $1),
                updated_at = NOW()
            WHERE id = $2 AND NOT ($1 = ANY(collaborators))
            "#,
        )
        .bind(user)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
