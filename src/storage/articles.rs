use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashMap;

use super::schema::Database;
use super::types::{Article, ArticleFilter, ParsedArticle};

/// Hard cap on any single article listing (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Columns of the joined article projection, matching `Article`'s FromRow.
const ARTICLE_COLUMNS: &str = "a.id, a.feed_id, f.title AS feed_title, a.title, a.url, \
     a.image_url, a.audio_url, a.published, a.read, a.favorite, \
     a.read_later, a.hidden, a.translated_title";

/// Minimal projection the rule engine evaluates over.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleArticle {
    pub id: i64,
    pub feed_name: String,
    pub feed_category: String,
    pub title: String,
    pub published: i64,
    pub read: bool,
    pub favorite: bool,
}

impl Database {
    // ========================================================================
    // Ingest
    // ========================================================================

    /// Transactional batch insert of parsed articles.
    ///
    /// `INSERT OR IGNORE` keyed on (feed_id, dedup_key) makes repeated
    /// fetches of an unchanged payload idempotent: the second run inserts
    /// zero rows. Returns the ids of the rows actually inserted so the
    /// caller can enrich exactly the new articles; the count the fetcher
    /// short-circuits on is the length.
    ///
    /// Feed-provided HTML bodies are stored into `article_contents` for the
    /// new rows in the same transaction.
    pub async fn save_articles(
        &self,
        feed_id: i64,
        articles: &[ParsedArticle],
    ) -> Result<Vec<i64>> {
        if articles.is_empty() {
            return Ok(Vec::new());
        }

        // Batch size keeps parameter count well under SQLite's 999 limit
        const BATCH_SIZE: usize = 50;
        let mut inserted_ids = Vec::new();

        let mut tx = self.pool.begin().await?;

        for chunk in articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles \
                 (feed_id, dedup_key, title, url, image_url, audio_url, published) ",
            );

            builder.push_values(chunk, |mut b, article| {
                b.push_bind(feed_id)
                    .push_bind(article.dedup_key())
                    .push_bind(&article.title)
                    .push_bind(&article.url)
                    .push_bind(&article.image_url)
                    .push_bind(&article.audio_url)
                    .push_bind(article.published);
            });
            builder.push(" RETURNING id, dedup_key");

            // Ignored duplicates return no row, so this yields new rows only
            let new_rows: Vec<(i64, String)> =
                builder.build_query_as().fetch_all(&mut *tx).await?;

            if new_rows.is_empty() {
                continue;
            }

            let content_by_key: HashMap<String, &str> = chunk
                .iter()
                .filter_map(|a| {
                    a.content
                        .as_deref()
                        .map(|c| (a.dedup_key(), c))
                })
                .collect();

            let now = chrono::Utc::now().timestamp();
            let with_content: Vec<(i64, &str)> = new_rows
                .iter()
                .filter_map(|(id, key)| content_by_key.get(key).map(|c| (*id, *c)))
                .collect();

            if !with_content.is_empty() {
                let mut content_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                    "INSERT OR REPLACE INTO article_contents (article_id, html, fetched_at) ",
                );
                content_builder.push_values(with_content.iter().copied(), |mut b, (id, html)| {
                    b.push_bind(id).push_bind(html).push_bind(now);
                });
                content_builder.build().execute(&mut *tx).await?;
            }

            inserted_ids.extend(new_rows.into_iter().map(|(id, _)| id));
        }

        tx.commit().await?;
        Ok(inserted_ids)
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Filtered article listing joined with the feed title.
    ///
    /// Order: `published DESC, id DESC` (id as tiebreaker so items sharing a
    /// timestamp keep a stable order). `category` selects the subtree:
    /// `news` matches both `news` and `news/world`.
    pub async fn get_articles(
        &self,
        filter: ArticleFilter,
        feed_id: Option<i64>,
        category: Option<&str>,
        show_hidden: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Article>> {
        let limit = limit.clamp(1, MAX_ARTICLES);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a \
             JOIN feeds f ON f.id = a.feed_id WHERE 1 = 1"
        ));

        match filter {
            ArticleFilter::All => {}
            ArticleFilter::Unread => {
                builder.push(" AND a.read = 0");
            }
            ArticleFilter::Favorites => {
                builder.push(" AND a.favorite = 1");
            }
            ArticleFilter::ReadLater => {
                builder.push(" AND a.read_later = 1");
            }
            ArticleFilter::ImageGallery => {
                builder.push(" AND f.image_mode = 1 AND a.image_url IS NOT NULL");
            }
        }

        if let Some(feed_id) = feed_id {
            builder.push(" AND a.feed_id = ");
            builder.push_bind(feed_id);
        }

        if let Some(category) = category {
            builder.push(" AND (f.category = ");
            builder.push_bind(category.to_owned());
            builder.push(" OR f.category LIKE ");
            builder.push_bind(format!("{category}/%"));
            builder.push(")");
        }

        if !show_hidden {
            builder.push(" AND a.hidden = 0 AND f.hidden = 0");
        }

        builder.push(" ORDER BY a.published DESC, a.id DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset.max(0));

        let articles: Vec<Article> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(articles)
    }

    pub async fn get_article_by_id(&self, id: i64) -> Result<Option<Article>> {
        let article: Option<Article> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a \
             JOIN feeds f ON f.id = a.feed_id WHERE a.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(article)
    }

    /// Fetch specific articles by id, newest first. Used by the filtered
    /// listing endpoint after the condition evaluator has picked the ids.
    pub async fn get_articles_by_ids(&self, ids: &[i64]) -> Result<Vec<Article>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a \
             JOIN feeds f ON f.id = a.feed_id WHERE a.id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY a.published DESC, a.id DESC");

        let articles: Vec<Article> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(articles)
    }

    /// Articles projected for rule evaluation, optionally restricted to the
    /// given ids (the rule engine passes the freshly-inserted rows here).
    pub async fn get_articles_for_rules(&self, ids: Option<&[i64]>) -> Result<Vec<RuleArticle>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT a.id, f.title AS feed_name, f.category AS feed_category, \
             a.title, a.published, a.read, a.favorite \
             FROM articles a JOIN feeds f ON f.id = a.feed_id",
        );

        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" WHERE a.id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        let rows: Vec<RuleArticle> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    // ========================================================================
    // Flag mutations
    // ========================================================================

    /// Idempotent read-state update; returns whether a row changed.
    pub async fn mark_article_read(&self, id: i64, read: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET read = ? WHERE id = ? AND read != ?")
            .bind(read)
            .bind(id)
            .bind(read)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic toggle via RETURNING, no read-modify-write race.
    pub async fn toggle_favorite(&self, id: i64) -> Result<bool> {
        let result: (bool,) = sqlx::query_as(
            "UPDATE articles SET favorite = NOT favorite WHERE id = ? RETURNING favorite",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    pub async fn set_article_favorite(&self, id: i64, favorite: bool) -> Result<()> {
        sqlx::query("UPDATE articles SET favorite = ? WHERE id = ?")
            .bind(favorite)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn toggle_article_hidden(&self, id: i64) -> Result<bool> {
        let result: (bool,) =
            sqlx::query_as("UPDATE articles SET hidden = NOT hidden WHERE id = ? RETURNING hidden")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(result.0)
    }

    pub async fn set_article_hidden(&self, id: i64, hidden: bool) -> Result<()> {
        sqlx::query("UPDATE articles SET hidden = ? WHERE id = ?")
            .bind(hidden)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Toggle read-later. Entering the list clears the read flag so the
    /// article resurfaces as unread; leaving it keeps read-state as is.
    /// SET expressions see the pre-update row, so `read_later = 0` below
    /// means "about to become 1".
    pub async fn toggle_read_later(&self, id: i64) -> Result<bool> {
        let result: (bool,) = sqlx::query_as(
            "UPDATE articles SET \
             read = CASE WHEN read_later = 0 THEN 0 ELSE read END, \
             read_later = NOT read_later \
             WHERE id = ? RETURNING read_later",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    pub async fn clear_read_later(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE articles SET read_later = 0 WHERE read_later = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_translated_title(&self, id: i64, translated: &str) -> Result<()> {
        sqlx::query("UPDATE articles SET translated_title = ? WHERE id = ?")
            .bind(translated)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Bulk read-state
    // ========================================================================

    pub async fn mark_all_read(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE articles SET read = 1 WHERE read = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_all_read_for_feed(&self, feed_id: i64) -> Result<u64> {
        let result = sqlx::query("UPDATE articles SET read = 1 WHERE feed_id = ? AND read = 0")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_all_read_for_category(&self, category: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE articles SET read = 1 WHERE read = 0 AND feed_id IN \
             (SELECT id FROM feeds WHERE category = ? OR category LIKE ?)",
        )
        .bind(category)
        .bind(format!("{category}/%"))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Counts
    // ========================================================================

    pub async fn get_total_unread_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles a JOIN feeds f ON f.id = a.feed_id \
             WHERE a.read = 0 AND a.hidden = 0 AND f.hidden = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn unread_counts_per_feed(&self) -> Result<HashMap<i64, i64>> {
        self.counts_per_feed("read = 0").await
    }

    pub async fn favorite_counts_per_feed(&self) -> Result<HashMap<i64, i64>> {
        self.counts_per_feed("favorite = 1").await
    }

    pub async fn read_later_counts_per_feed(&self) -> Result<HashMap<i64, i64>> {
        self.counts_per_feed("read_later = 1").await
    }

    /// Per-feed count of articles carrying an image, for image-mode feeds.
    pub async fn image_counts_per_feed(&self) -> Result<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT a.feed_id, COUNT(*) FROM articles a \
             JOIN feeds f ON f.id = a.feed_id \
             WHERE f.image_mode = 1 AND a.image_url IS NOT NULL \
             GROUP BY a.feed_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn counts_per_feed(&self, predicate: &str) -> Result<HashMap<i64, i64>> {
        // `predicate` is one of the fixed flag conditions above, never input
        let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
            "SELECT feed_id, COUNT(*) FROM articles WHERE {predicate} GROUP BY feed_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
