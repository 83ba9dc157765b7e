use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

use crate::storage::{Database, SettingKey};

use super::summarize::{summarize_ai, summarize_local, SummaryLength, SummaryResult};
use super::translate::{EnrichError, TranslatorCache, TranslatorConfig};

/// What kind of enrichment a request is for; one in-flight slot per
/// (article, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichKind {
    Translation,
    Summary,
}

enum Role {
    Leader(watch::Sender<Option<String>>),
    Follower(watch::Receiver<Option<String>>),
}

/// Fans article enrichment out to the configured providers with
/// at-most-once semantics per (article, kind).
///
/// The in-flight map holds placeholders only — a watch receiver a late
/// caller can await — never results; results land in the store (translated
/// titles) or ride the channel value once (summaries).
pub struct Orchestrator {
    db: Database,
    client: reqwest::Client,
    translators: TranslatorCache,
    inflight: Mutex<HashMap<(i64, EnrichKind), watch::Receiver<Option<String>>>>,
}

impl Orchestrator {
    pub fn new(db: Database, client: reqwest::Client) -> Self {
        Self {
            db,
            client,
            translators: TranslatorCache::default(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Translate an article's title, storing the result.
    ///
    /// Returns the translated title. An already-translated article returns
    /// the stored value without any outbound call; a concurrent request for
    /// the same article awaits the first one's result.
    pub async fn translate_title(&self, article_id: i64) -> Result<String, EnrichError> {
        let article = self
            .db
            .get_article_by_id(article_id)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?
            .ok_or_else(|| EnrichError::Internal(format!("no article {article_id}")))?;

        if let Some(existing) = article.translated_title {
            return Ok(existing);
        }

        let key = (article_id, EnrichKind::Translation);
        match self.claim(key) {
            Role::Follower(rx) => self.await_leader(rx, key).await,
            Role::Leader(tx) => {
                let result = self.do_translate(article_id, &article.title).await;
                self.release(key, &tx, result.as_ref().ok());
                result
            }
        }
    }

    /// Summarise an article's cached content (or its title when there is
    /// no content). Concurrent requests coalesce; the result rides the
    /// in-flight channel since summaries are not persisted.
    pub async fn summarize_article(&self, article_id: i64) -> Result<SummaryResult, EnrichError> {
        let key = (article_id, EnrichKind::Summary);
        match self.claim(key) {
            Role::Follower(rx) => {
                let summary = self.await_leader(rx, key).await?;
                Ok(SummaryResult {
                    summary,
                    is_too_short: false,
                })
            }
            Role::Leader(tx) => {
                let result = self.do_summarize(article_id).await;
                self.release(key, &tx, result.as_ref().ok().map(|r| &r.summary));
                result
            }
        }
    }

    /// Post-ingest hook: translate the titles of freshly inserted articles
    /// when translation is enabled. Per-article failures are logged and the
    /// article stays untranslated.
    pub async fn translate_new_articles(&self, article_ids: &[i64]) {
        let enabled = self
            .db
            .setting_bool(SettingKey::TranslationEnabled)
            .await
            .unwrap_or(false);
        if !enabled || article_ids.is_empty() {
            return;
        }

        for &id in article_ids {
            if let Err(e) = self.translate_title(id).await {
                tracing::warn!(article_id = id, error = %e, "title translation failed");
            }
        }
    }

    // ========================================================================
    // Coalescing
    // ========================================================================

    fn claim(&self, key: (i64, EnrichKind)) -> Role {
        let mut inflight = self.inflight.lock();
        match inflight.get(&key) {
            Some(rx) => Role::Follower(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key, rx);
                Role::Leader(tx)
            }
        }
    }

    async fn await_leader(
        &self,
        mut rx: watch::Receiver<Option<String>>,
        key: (i64, EnrichKind),
    ) -> Result<String, EnrichError> {
        // A dropped sender (leader failed) also wakes us; the borrow then
        // still holds None and we surface the failure.
        let _ = rx.changed().await;
        let value = rx.borrow().clone();
        value.ok_or_else(|| {
            EnrichError::Upstream(format!(
                "enrichment for article {} failed in the originating request",
                key.0
            ))
        })
    }

    fn release(
        &self,
        key: (i64, EnrichKind),
        tx: &watch::Sender<Option<String>>,
        value: Option<&String>,
    ) {
        // Publish and clear under one critical section: a concurrent
        // claim() must never find the slot empty while the result is still
        // unsent, or it would become a second leader for the same pair
        let mut inflight = self.inflight.lock();
        if let Some(value) = value {
            let _ = tx.send(Some(value.clone()));
        }
        inflight.remove(&key);
        // On error the sender simply drops; followers observe the closed
        // channel and report the failure
    }

    // ========================================================================
    // Work
    // ========================================================================

    async fn do_translate(&self, article_id: i64, title: &str) -> Result<String, EnrichError> {
        let config = TranslatorConfig::load(&self.db)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?;
        let target = self
            .db
            .get_setting(SettingKey::TargetLanguage)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?;

        let translated = self
            .translators
            .translate(&config, &self.client, title, &target)
            .await?;

        if !translated.is_empty() {
            self.db
                .set_translated_title(article_id, &translated)
                .await
                .map_err(|e| EnrichError::Internal(e.to_string()))?;
        }

        Ok(translated)
    }

    async fn do_summarize(&self, article_id: i64) -> Result<SummaryResult, EnrichError> {
        let article = self
            .db
            .get_article_by_id(article_id)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?
            .ok_or_else(|| EnrichError::Internal(format!("no article {article_id}")))?;

        let text = self
            .db
            .get_article_content(article_id)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?
            .unwrap_or_else(|| article.title.clone());

        let length = SummaryLength::parse(
            &self
                .db
                .get_setting(SettingKey::SummaryLength)
                .await
                .map_err(|e| EnrichError::Internal(e.to_string()))?,
        );
        let provider = self
            .db
            .get_setting(SettingKey::SummaryProvider)
            .await
            .map_err(|e| EnrichError::Internal(e.to_string()))?;

        match provider.as_str() {
            "ai" => {
                let endpoint = self
                    .db
                    .get_setting(SettingKey::AiSummaryEndpoint)
                    .await
                    .map_err(|e| EnrichError::Internal(e.to_string()))?;
                let api_key = self
                    .db
                    .get_setting(SettingKey::AiSummaryApiKey)
                    .await
                    .map_err(|e| EnrichError::Internal(e.to_string()))?;
                let model = self
                    .db
                    .get_setting(SettingKey::AiSummaryModel)
                    .await
                    .map_err(|e| EnrichError::Internal(e.to_string()))?;

                let summary =
                    summarize_ai(&self.client, &endpoint, &api_key, &model, &text, length).await?;
                Ok(SummaryResult {
                    summary,
                    is_too_short: false,
                })
            }
            _ => Ok(summarize_local(&text, length)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedKind, NewFeed, ParsedArticle};
    use crate::vault::Vault;
    use std::sync::Arc;

    async fn setup() -> (Database, Arc<Orchestrator>, i64) {
        let db = Database::open(":memory:", Vault::with_secret("test|linux|x86_64"))
            .await
            .unwrap();
        let feed_id = db
            .add_feed(&NewFeed {
                title: "Feed".into(),
                url: "https://example.com/rss".into(),
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
            })
            .await
            .unwrap();
        let ids = db
            .save_articles(
                feed_id,
                &[ParsedArticle {
                    title: "Breaking news".into(),
                    url: Some("https://example.com/a".into()),
                    image_url: None,
                    audio_url: None,
                    published: 100,
                    content: None,
                    uid: None,
                }],
            )
            .await
            .unwrap();

        db.set_setting(SettingKey::TranslationProvider, "mock")
            .await
            .unwrap();
        db.set_setting(SettingKey::TargetLanguage, "es").await.unwrap();
        db.set_setting(SettingKey::TranslationEnabled, "true")
            .await
            .unwrap();

        let orch = Arc::new(Orchestrator::new(db.clone(), reqwest::Client::new()));
        (db, orch, ids[0])
    }

    #[tokio::test]
    async fn test_translate_title_stores_result() {
        let (db, orch, id) = setup().await;
        let translated = orch.translate_title(id).await.unwrap();
        assert_eq!(translated, "[ES] Breaking news");

        let article = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(article.translated_title.as_deref(), Some("[ES] Breaking news"));
    }

    #[tokio::test]
    async fn test_translate_title_reuses_stored_value() {
        let (db, orch, id) = setup().await;
        orch.translate_title(id).await.unwrap();

        // Switch target language; the stored translation still wins —
        // at-most-once per article
        db.set_setting(SettingKey::TargetLanguage, "fr").await.unwrap();
        let second = orch.translate_title(id).await.unwrap();
        assert_eq!(second, "[ES] Breaking news");
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let (_db, orch, id) = setup().await;

        let a = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.translate_title(id).await }
        });
        let b = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.translate_title(id).await }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, "[ES] Breaking news");
        assert_eq!(a, b);
        assert!(orch.inflight.lock().is_empty(), "in-flight set drains");
    }

    #[tokio::test]
    async fn test_translate_new_articles_honours_toggle() {
        let (db, orch, id) = setup().await;
        db.set_setting(SettingKey::TranslationEnabled, "false")
            .await
            .unwrap();

        orch.translate_new_articles(&[id]).await;
        let article = db.get_article_by_id(id).await.unwrap().unwrap();
        assert!(article.translated_title.is_none());
    }

    #[tokio::test]
    async fn test_summarize_without_content_uses_title() {
        let (_db, orch, id) = setup().await;
        let result = orch.summarize_article(id).await.unwrap();
        assert!(result.is_too_short, "a bare title is below the minimum");
        assert_eq!(result.summary, "Breaking news");
    }
}
