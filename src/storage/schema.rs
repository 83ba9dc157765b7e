use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::vault::Vault;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of trawl appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Subscribe attempt for a URL that already has a non-managed feed
    #[error("Feed already subscribed: {0}")]
    DuplicateUrl(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Database
// ============================================================================

/// Store handle: a connection pool plus the vault for encrypted settings.
///
/// Cheap to clone; every subsystem (scheduler, workers, HTTP handlers)
/// holds its own copy. SQLite serialises writers, readers share.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) vault: Vault,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` when another instance holds
    /// the database, `DatabaseError::Migration` when the schema could not be
    /// brought up to date, `DatabaseError::Other` otherwise.
    pub async fn open(path: &str, vault: Vault) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the database file to the owning user. Credentials are
        // encrypted at rest but the rest of the row data is not.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    // Create with mode 0600 up front so there is no window
                    // with default umask permissions.
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite reports it at connect.
                }
            }
        }

        // busy_timeout=5000: wait up to 5s for locks instead of failing with
        // SQLITE_BUSY on transient contention (scheduler batch vs API write).
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // Single writer; a handful of connections covers concurrent readers
        // (worker pool + API queries).
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool, vault };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running against an existing
    /// database is a no-op. If any step fails the transaction rolls back and
    /// the previous schema stays intact.
    async fn migrate(&self) -> Result<()> {
        // Per-connection setting, must run outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                image_url TEXT,
                kind TEXT NOT NULL DEFAULT 'rss',
                item_xpath TEXT,
                title_xpath TEXT,
                content_xpath TEXT,
                link_xpath TEXT,
                author_xpath TEXT,
                time_xpath TEXT,
                time_format TEXT,
                thumb_xpath TEXT,
                category_xpath TEXT,
                uid_xpath TEXT,
                script_path TEXT,
                hidden INTEGER NOT NULL DEFAULT 0,
                image_mode INTEGER NOT NULL DEFAULT 0,
                proxy_url TEXT,
                refresh_interval INTEGER NOT NULL DEFAULT 0,
                last_updated INTEGER,
                last_error TEXT,
                last_status TEXT NOT NULL DEFAULT 'unknown',
                managed INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // URL is unique among user-owned feeds only; managed (externally
        // synchronised) rows may duplicate a user subscription.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_feeds_url_unmanaged ON feeds(url) WHERE managed = 0",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                dedup_key TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT,
                image_url TEXT,
                audio_url TEXT,
                published INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                favorite INTEGER NOT NULL DEFAULT 0,
                read_later INTEGER NOT NULL DEFAULT 0,
                hidden INTEGER NOT NULL DEFAULT 0,
                translated_title TEXT,
                UNIQUE(feed_id, dedup_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_feed_published ON articles(feed_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;
        // Composite index for unread count aggregation per feed
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed_read ON articles(feed_id, read)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_favorite ON articles(favorite) WHERE favorite = 1",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_read_later ON articles(read_later) WHERE read_later = 1",
        )
        .execute(&mut *tx)
        .await?;

        // Content is a cache keyed by article id, cleanable independently
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS article_contents (
                article_id INTEGER PRIMARY KEY REFERENCES articles(id) ON DELETE CASCADE,
                html TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_db;

    #[tokio::test]
    async fn test_open_in_memory_migrates() {
        let db = test_db().await;
        let feeds = db.get_feeds().await.unwrap();
        assert!(feeds.is_empty());
    }

    #[tokio::test]
    async fn test_open_twice_is_clean() {
        // Each :memory: open is a fresh database; open() must never fail on
        // a clean slate and migrations must be self-contained.
        let _db1 = test_db().await;
        let _db2 = test_db().await;
    }
}
