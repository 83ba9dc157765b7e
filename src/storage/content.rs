use anyhow::Result;

use super::schema::Database;

impl Database {
    // ========================================================================
    // Article content cache
    // ========================================================================

    /// Cached HTML body for an article, if any.
    pub async fn get_article_content(&self, article_id: i64) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT html FROM article_contents WHERE article_id = ?")
                .bind(article_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(html,)| html))
    }

    /// Store (or replace) the HTML body for an article.
    ///
    /// Used both at ingest time for feed-provided bodies and by the
    /// full-text fetch path when it extracts a readable page.
    pub async fn set_article_content(&self, article_id: i64, html: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT OR REPLACE INTO article_contents (article_id, html, fetched_at) VALUES (?, ?, ?)",
        )
        .bind(article_id)
        .bind(html)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_article_content_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM article_contents")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
