//! Durable set of authorized client key fingerprints, backed by SQLite.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to prepare key database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key database error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKey {
    pub fingerprint: String,
    pub public_key: Vec<u8>,
    /// Unix seconds.
    pub created_at: i64,
    pub last_used: Option<i64>,
}

const CREATE_KEYS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS keys (
        fingerprint TEXT PRIMARY KEY,
        public_key BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        last_used INTEGER
    )
"#;

#[derive(Clone)]
pub struct KeyRegistry {
    pool: SqlitePool,
}

impl KeyRegistry {
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| RegistryError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let registry = Self { pool };
        registry.migrate().await?;
        info!(path = %path.display(), "key registry opened");
        Ok(registry)
    }

    /// Private in-memory database; one pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(CREATE_KEYS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn exists(&self, fingerprint: &str) -> Result<bool, RegistryError> {
        let row = sqlx::query("SELECT 1 FROM keys WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent: concurrent first connections from one key all succeed and
    /// leave a single row behind.
    pub async fn register(
        &self,
        fingerprint: &str,
        public_key: &[u8],
    ) -> Result<Registration, RegistryError> {
        let result = sqlx::query(
            "INSERT INTO keys (fingerprint, public_key, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(fingerprint) DO NOTHING",
        )
        .bind(fingerprint)
        .bind(public_key)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            Registration::Created
        } else {
            Registration::AlreadyExists
        })
    }

    pub async fn touch_last_used(&self, fingerprint: &str) -> Result<(), RegistryError> {
        sqlx::query("UPDATE keys SET last_used = ? WHERE fingerprint = ?")
            .bind(now())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, RegistryError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM keys")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<RegisteredKey>, RegistryError> {
        let row = sqlx::query(
            "SELECT fingerprint, public_key, created_at, last_used FROM keys WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| key_from_row(&row)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<RegisteredKey>, RegistryError> {
        let rows = sqlx::query(
            "SELECT fingerprint, public_key, created_at, last_used FROM keys ORDER BY created_at, fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_from_row).collect()
    }

    /// Administrative removal; returns whether a row was deleted.
    pub async fn remove(&self, fingerprint: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM keys WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn key_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RegisteredKey, RegistryError> {
    Ok(RegisteredKey {
        fingerprint: row.try_get("fingerprint")?,
        public_key: row.try_get("public_key")?,
        created_at: row.try_get("created_at")?,
        last_used: row.try_get("last_used")?,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
