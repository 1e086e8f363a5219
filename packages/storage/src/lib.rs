// ABOUTME: Database bootstrap layer shared by the talkback packages
// ABOUTME: Provides the SQLite pool, shared storage errors and migrations

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub enable_wal: bool,
    pub max_connections: u32,
    pub busy_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("talkback.db"),
            enable_wal: true,
            max_connections: 10,
            busy_timeout_seconds: 30,
        }
    }
}

/// Open (creating if necessary) the SQLite database described by the config
/// and return a configured connection pool.
pub async fn connect(config: &StorageConfig) -> StorageResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
        }
    }

    let database_url = format!("sqlite:{}", config.database_path.display());

    if !sqlx::Sqlite::database_exists(&database_url)
        .await
        .map_err(StorageError::Sqlx)?
    {
        debug!("Creating database at: {}", database_url);
        sqlx::Sqlite::create_database(&database_url)
            .await
            .map_err(StorageError::Sqlx)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.busy_timeout_seconds))
        .connect(&database_url)
        .await
        .map_err(StorageError::Sqlx)?;

    if config.enable_wal {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(StorageError::Sqlx)?;
    }

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .map_err(StorageError::Sqlx)?;

    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await
        .map_err(StorageError::Sqlx)?;

    info!("Database connection established");

    Ok(pool)
}

/// Run the bundled migrations, creating the default `comments` table.
///
/// Deployments with their own table layout can skip this and manage the
/// schema themselves; the comments engine only assumes the structural
/// columns exist on whatever table it is configured with.
pub async fn initialize(pool: &SqlitePool) -> StorageResult<()> {
    info!("Initializing storage with migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(StorageError::Migration)?;

    debug!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            database_path: dir.path().join("nested").join("test.db"),
            ..StorageConfig::default()
        };

        let pool = connect(&config).await.unwrap();
        initialize(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            database_path: dir.path().join("test.db"),
            ..StorageConfig::default()
        };

        let pool = connect(&config).await.unwrap();
        initialize(&pool).await.unwrap();
        initialize(&pool).await.unwrap();
    }
}
