//! Secret store
//!
//! Secrets are JSON documents keyed by path (`global/<name>` for
//! site-wide secrets).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::error::CollaboratorError;

/// Path of a site-wide secret
pub fn global_secret_path(name: &str) -> String {
    format!("global/{name}")
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create or replace the secret at `path`
    async fn create_or_update(&self, path: &str, value: Value) -> Result<(), CollaboratorError>;

    /// Read the secret at `path`
    async fn get(&self, path: &str) -> Result<Option<Value>, CollaboratorError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Secret store for tests and single-process runs
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, Value>>,
    writes: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `create_or_update` calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of every stored secret
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.secrets.read().clone()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn create_or_update(&self, path: &str, value: Value) -> Result<(), CollaboratorError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.secrets.write().insert(path.to_string(), value);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, CollaboratorError> {
        Ok(self.secrets.read().get(path).cloned())
    }
}

// =============================================================================
// PostgreSQL store
// =============================================================================

/// Secret store backed by `maasserver_secret`
#[derive(Clone)]
pub struct PostgresSecretStore {
    pool: PgPool,
}

impl PostgresSecretStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PostgresSecretStore {
    #[instrument(skip(self, value))]
    async fn create_or_update(&self, path: &str, value: Value) -> Result<(), CollaboratorError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT value FROM maasserver_secret WHERE path = $1 FOR UPDATE")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            Some(row) if row.get::<Value, _>("value") == value => {
                debug!("secret unchanged");
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE maasserver_secret SET value = $2, updated = NOW() WHERE path = $1",
                )
                .bind(path)
                .bind(&value)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO maasserver_secret (path, value, created, updated)
                    VALUES ($1, $2, NOW(), NOW())
                    ON CONFLICT (path) DO UPDATE SET value = EXCLUDED.value, updated = NOW()
                    "#,
                )
                .bind(path)
                .bind(&value)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Option<Value>, CollaboratorError> {
        let row = sqlx::query("SELECT value FROM maasserver_secret WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_repeated_write_leaves_same_state() {
        let store = InMemorySecretStore::new();
        let path = global_secret_path("msm-connector");
        let value = json!({"url": "https://msm.example.com/site/v1/enrol", "jwt": "abc"});

        store
            .create_or_update(&path, value.clone())
            .await
            .expect("should write");
        let once = store.snapshot();

        store
            .create_or_update(&path, value.clone())
            .await
            .expect("should write");

        assert_eq!(store.snapshot(), once);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.get(&path).await.expect("should read"), Some(value));
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let store = InMemorySecretStore::new();
        assert_eq!(store.get("global/none").await.expect("should read"), None);
    }
}
