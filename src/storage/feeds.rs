use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::{Database, DatabaseError};
use super::types::{Feed, FeedRow, NewFeed};

/// Columns selected for every feed query, kept in one place so the
/// `FeedRow` mapping cannot drift from the SQL.
const FEED_COLUMNS: &str = "id, title, url, category, image_url, kind, \
     item_xpath, title_xpath, content_xpath, link_xpath, author_xpath, \
     time_xpath, time_format, thumb_xpath, category_xpath, uid_xpath, \
     script_path, hidden, image_mode, proxy_url, refresh_interval, \
     last_updated, last_error, last_status, managed, consecutive_failures";

impl Database {
    // ========================================================================
    // Feed CRUD
    // ========================================================================

    /// Subscribe to a feed. Returns the new feed id.
    ///
    /// A duplicate URL among non-managed feeds maps to
    /// [`DatabaseError::DuplicateUrl`] via the partial unique index.
    pub async fn add_feed(&self, feed: &NewFeed) -> Result<i64, DatabaseError> {
        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO feeds (
                title, url, category, image_url, kind,
                item_xpath, title_xpath, content_xpath, link_xpath, author_xpath,
                time_xpath, time_format, thumb_xpath, category_xpath, uid_xpath,
                script_path, hidden, image_mode, proxy_url, refresh_interval, managed
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(&feed.image_url)
        .bind(feed.kind.as_str())
        .bind(&feed.selectors.item)
        .bind(&feed.selectors.title)
        .bind(&feed.selectors.content)
        .bind(&feed.selectors.link)
        .bind(&feed.selectors.author)
        .bind(&feed.selectors.time)
        .bind(&feed.selectors.time_format)
        .bind(&feed.selectors.thumbnail)
        .bind(&feed.selectors.categories)
        .bind(&feed.selectors.uid)
        .bind(&feed.script_path)
        .bind(feed.hidden)
        .bind(feed.image_mode)
        .bind(&feed.proxy_url)
        .bind(feed.refresh_interval)
        .bind(feed.managed)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => Ok(id),
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(DatabaseError::DuplicateUrl(feed.url.clone()))
            }
            Err(e) => Err(DatabaseError::from_sqlx(e)),
        }
    }

    /// Update a feed's user-editable fields.
    ///
    /// Managed feeds are read-only to the user; the `managed = 0` guard makes
    /// this a no-op for them and the caller maps that to Forbidden.
    pub async fn update_feed(&self, id: i64, feed: &NewFeed) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                title = ?, url = ?, category = ?, image_url = ?, kind = ?,
                item_xpath = ?, title_xpath = ?, content_xpath = ?, link_xpath = ?,
                author_xpath = ?, time_xpath = ?, time_format = ?, thumb_xpath = ?,
                category_xpath = ?, uid_xpath = ?, script_path = ?,
                hidden = ?, image_mode = ?, proxy_url = ?, refresh_interval = ?
            WHERE id = ? AND managed = 0
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(&feed.image_url)
        .bind(feed.kind.as_str())
        .bind(&feed.selectors.item)
        .bind(&feed.selectors.title)
        .bind(&feed.selectors.content)
        .bind(&feed.selectors.link)
        .bind(&feed.selectors.author)
        .bind(&feed.selectors.time)
        .bind(&feed.selectors.time_format)
        .bind(&feed.selectors.thumbnail)
        .bind(&feed.selectors.categories)
        .bind(&feed.selectors.uid)
        .bind(&feed.script_path)
        .bind(feed.hidden)
        .bind(feed.image_mode)
        .bind(&feed.proxy_url)
        .bind(feed.refresh_interval)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Unsubscribe. Articles and cached content go with the feed (FK cascade).
    pub async fn delete_feed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ? AND managed = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete several feeds in one transaction; returns how many went.
    pub async fn batch_delete_feeds(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM feeds WHERE managed = 0 AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    /// Move several feeds to a category path; returns how many moved.
    pub async fn batch_move_feeds(&self, ids: &[i64], category: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE feeds SET category = ");
        builder.push_bind(category);
        builder.push(" WHERE managed = 0 AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        let rows: Vec<FeedRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY category, title"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    pub async fn get_feed_by_id(&self, id: i64) -> Result<Option<Feed>> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(FeedRow::into_feed))
    }

    // ========================================================================
    // Fetch bookkeeping
    // ========================================================================

    /// Stamp a successful fetch: clears the error, resets back-off.
    pub async fn record_fetch_success(&self, feed_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET last_updated = ?, last_error = NULL, \
             last_status = 'success', consecutive_failures = 0 WHERE id = ?",
        )
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp a failed fetch and bump the back-off counter.
    ///
    /// `last_updated` advances too: the next due time is computed from it,
    /// and without the stamp a broken feed would be retried on every tick.
    /// Returns the new consecutive failure count.
    pub async fn record_fetch_failure(
        &self,
        feed_id: i64,
        error: &str,
        now: i64,
    ) -> Result<i64> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE feeds SET last_updated = ?, last_error = ?, last_status = 'failed', \
             consecutive_failures = consecutive_failures + 1 \
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(now)
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Refresh feed metadata discovered during parsing (title, icon) without
    /// touching user-edited fields that are already set.
    pub async fn update_feed_metadata(
        &self,
        feed_id: i64,
        title: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET \
             title = CASE WHEN title = '' AND ? IS NOT NULL THEN ? ELSE title END, \
             image_url = COALESCE(image_url, ?) \
             WHERE id = ?",
        )
        .bind(title)
        .bind(title)
        .bind(image_url)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of articles published since `since` — the adaptive interval's
    /// posting-cadence sample.
    pub async fn recent_article_count(&self, feed_id: i64, since: i64) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ? AND published >= ?")
                .bind(feed_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::schema::test_support::test_db;
    use crate::storage::{DatabaseError, FeedKind, NewFeed};

    fn test_feed(n: i64) -> NewFeed {
        NewFeed {
            title: format!("Test Feed {n}"),
            url: format!("https://feed{n}.example.com/rss"),
            category: String::new(),
            image_url: None,
            kind: FeedKind::Rss,
            selectors: Default::default(),
            script_path: None,
            hidden: false,
            image_mode: false,
            proxy_url: None,
            refresh_interval: 0,
            managed: false,
        }
    }

    #[tokio::test]
    async fn test_add_and_get_feed() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed(1)).await.unwrap();
        assert!(id > 0);

        let feed = db.get_feed_by_id(id).await.unwrap().unwrap();
        assert_eq!(feed.title, "Test Feed 1");
        assert_eq!(feed.url, "https://feed1.example.com/rss");
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.last_updated.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_url_rejected() {
        let db = test_db().await;
        db.add_feed(&test_feed(1)).await.unwrap();

        let err = db.add_feed(&test_feed(1)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateUrl(_)));
    }

    #[tokio::test]
    async fn test_managed_feed_may_duplicate_url() {
        let db = test_db().await;
        db.add_feed(&test_feed(1)).await.unwrap();

        let mut managed = test_feed(1);
        managed.managed = true;
        // Same URL is fine: the unique index only covers managed = 0
        db.add_feed(&managed).await.unwrap();

        assert_eq!(db.get_feeds().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_feed_skips_managed() {
        let db = test_db().await;
        let mut managed = test_feed(1);
        managed.managed = true;
        let id = db.add_feed(&managed).await.unwrap();

        let mut edit = test_feed(1);
        edit.title = "Edited".into();
        let changed = db.update_feed(id, &edit).await.unwrap();
        assert!(!changed, "managed feeds are read-only to user edits");
    }

    #[tokio::test]
    async fn test_delete_feed_cascades() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed(1)).await.unwrap();
        db.save_articles(
            id,
            &[crate::storage::ParsedArticle {
                title: "A".into(),
                url: Some("https://example.com/a".into()),
                image_url: None,
                audio_url: None,
                published: 100,
                content: Some("<p>body</p>".into()),
                uid: None,
            }],
        )
        .await
        .unwrap();

        assert!(db.delete_feed(id).await.unwrap());
        let articles = db
            .get_articles(Default::default(), None, None, true, 100, 0)
            .await
            .unwrap();
        assert!(articles.is_empty(), "articles must cascade with the feed");
        assert_eq!(db.get_article_content_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_move_feeds() {
        let db = test_db().await;
        let a = db.add_feed(&test_feed(1)).await.unwrap();
        let b = db.add_feed(&test_feed(2)).await.unwrap();

        let moved = db.batch_move_feeds(&[a, b], "news/world").await.unwrap();
        assert_eq!(moved, 2);

        let feed = db.get_feed_by_id(a).await.unwrap().unwrap();
        assert_eq!(feed.category, "news/world");
    }

    #[tokio::test]
    async fn test_record_failure_then_success_resets_backoff() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed(1)).await.unwrap();

        assert_eq!(db.record_fetch_failure(id, "timeout", 100).await.unwrap(), 1);
        assert_eq!(db.record_fetch_failure(id, "timeout", 200).await.unwrap(), 2);

        let feed = db.get_feed_by_id(id).await.unwrap().unwrap();
        assert_eq!(feed.last_error.as_deref(), Some("timeout"));
        assert_eq!(feed.last_updated, Some(200));
        assert_eq!(feed.last_status, crate::storage::UpdateStatus::Failed);

        db.record_fetch_success(id, 300).await.unwrap();
        let feed = db.get_feed_by_id(id).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.last_error.is_none());
        assert_eq!(feed.last_status, crate::storage::UpdateStatus::Success);
    }
}
