use anyhow::Result;

use super::schema::Database;
use super::settings::SettingKey;

impl Database {
    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete articles older than `max_article_age_days`.
    ///
    /// Favourites and read-later articles are excluded in the SQL predicate
    /// itself — user-pinned rows must never be visible to any deletion
    /// statement, not filtered afterwards in application code.
    pub async fn cleanup_old_articles(&self) -> Result<u64> {
        let max_age_days = self.setting_i64(SettingKey::MaxArticleAgeDays).await?;
        if max_age_days <= 0 {
            return Ok(0);
        }

        let cutoff = chrono::Utc::now().timestamp() - max_age_days * 86_400;
        let result = sqlx::query(
            "DELETE FROM articles WHERE published < ? AND favorite = 0 AND read_later = 0",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed = removed, cutoff = cutoff, "retention removed old articles");
        }
        Ok(removed)
    }

    /// Delete read, unpinned, unhidden-state articles regardless of age.
    /// The aggressive variant behind the "clean up unimportant" action.
    pub async fn cleanup_unimportant_articles(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM articles WHERE read = 1 AND favorite = 0 AND read_later = 0",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop every cached content row. Articles themselves are untouched.
    pub async fn cleanup_all_article_contents(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM article_contents")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove every article (and cascaded content). Feeds stay subscribed.
    pub async fn delete_all_articles(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM articles")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
