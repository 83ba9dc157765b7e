use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::media::rewrite_html;
use crate::rules::{evaluate, Condition};
use crate::state::AppState;
use crate::storage::{Article, ArticleFilter, SettingKey};

/// Path prefix stored URLs get rewritten onto
pub const MEDIA_PROXY_PATH: &str = "/api/media";

const DEFAULT_PAGE_SIZE: i64 = 50;

// ============================================================================
// Listing
// ============================================================================

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub filter: String,
    pub feed_id: Option<i64>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Vec<Article>>> {
    let filter = ArticleFilter::parse(&params.filter)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown filter: {}", params.filter)))?;

    let show_hidden = state.db.setting_bool(SettingKey::ShowHiddenArticles).await?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let page = params.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    let articles = state
        .db
        .get_articles(
            filter,
            params.feed_id,
            params.category.as_deref(),
            show_hidden,
            limit,
            offset,
        )
        .await?;
    Ok(Json(articles))
}

/// POST variant driven by a condition list — the same evaluator the rule
/// engine runs, so previews and rules agree by construction.
#[derive(Deserialize)]
pub struct FilteredRequest {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

pub async fn filtered(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FilteredRequest>,
) -> AppResult<Json<Vec<Article>>> {
    let candidates = state.db.get_articles_for_rules(None).await?;
    let matched: Vec<i64> = candidates
        .iter()
        .filter(|a| evaluate(&request.conditions, a))
        .map(|a| a.id)
        .collect();

    let articles = state.db.get_articles_by_ids(&matched).await?;

    let limit = request.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as usize;
    let offset = request.offset.max(0) as usize;
    let page: Vec<Article> = articles.into_iter().skip(offset).take(limit).collect();
    Ok(Json(page))
}

// ============================================================================
// Content
// ============================================================================

pub async fn content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let article = state
        .db
        .get_article_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("article {id}")))?;

    let view_mode = state.db.get_setting(SettingKey::DefaultViewMode).await?;

    if let Some(cached) = state.caches.article_html.get(&id) {
        return Ok(Json(
            serde_json::json!({ "content": cached, "view_mode": view_mode }),
        ));
    }

    let html = state.db.get_article_content(id).await?.unwrap_or_default();

    // Referer for the proxy defaults to the owning feed's URL
    let referer = state
        .db
        .get_feed_by_id(article.feed_id)
        .await?
        .map(|f| f.url)
        .unwrap_or_default();

    let rewritten = rewrite_html(&html, &referer, MEDIA_PROXY_PATH);
    state.caches.article_html.put(id, rewritten.clone());

    Ok(Json(
        serde_json::json!({ "content": rewritten, "view_mode": view_mode }),
    ))
}

/// Every image URL in the stored content, for the gallery view.
pub async fn images(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<String>>> {
    if state
        .db
        .get_article_by_id(id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound(format!("article {id}")));
    }

    let html = state.db.get_article_content(id).await?.unwrap_or_default();

    let doc = scraper::Html::parse_fragment(&html);
    let selector = scraper::Selector::parse("img")
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let mut seen = HashSet::new();
    let urls: Vec<String> = doc
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::to_owned)
        .filter(|src| seen.insert(src.clone()))
        .collect();

    Ok(Json(urls))
}

/// Replace the cached content with a readability extraction of the article
/// page. Feature-gated: 403 unless `full_text_fetch_enabled`.
pub async fn fetch_full_text(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.db.setting_bool(SettingKey::FullTextFetchEnabled).await? {
        return Err(AppError::Forbidden(
            "full-text fetch is disabled in settings".to_owned(),
        ));
    }

    let article = state
        .db
        .get_article_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("article {id}")))?;
    let url = article
        .url
        .ok_or_else(|| AppError::InvalidInput("article has no URL".to_owned()))?;

    let readable = crate::content::fetch_full_text(&state.client, &url).await?;
    state.db.set_article_content(id, &readable).await?;
    state.caches.article_html.invalidate(&id);

    Ok(Json(serde_json::json!({ "fetched": true })))
}

// ============================================================================
// Flags
// ============================================================================

#[derive(Deserialize)]
pub struct MarkReadRequest {
    #[serde(default = "default_true")]
    pub read: bool,
}

fn default_true() -> bool {
    true
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<MarkReadRequest>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    state.db.mark_article_read(id, request.read).await?;
    Ok(Json(serde_json::json!({ "read": request.read })))
}

pub async fn toggle_favorite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    let favorite = state.db.toggle_favorite(id).await?;
    Ok(Json(serde_json::json!({ "favorite": favorite })))
}

pub async fn toggle_hide(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    let hidden = state.db.toggle_article_hidden(id).await?;
    Ok(Json(serde_json::json!({ "hidden": hidden })))
}

pub async fn toggle_read_later(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    let read_later = state.db.toggle_read_later(id).await?;
    Ok(Json(serde_json::json!({ "read_later": read_later })))
}

pub async fn clear_read_later(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let cleared = state.db.clear_read_later().await?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

#[derive(Deserialize)]
pub struct MarkAllRequest {
    pub feed_id: Option<i64>,
    pub category: Option<String>,
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MarkAllRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let marked = match (request.feed_id, request.category) {
        (Some(feed_id), _) => state.db.mark_all_read_for_feed(feed_id).await?,
        (None, Some(category)) => state.db.mark_all_read_for_category(&category).await?,
        (None, None) => state.db.mark_all_read().await?,
    };
    Ok(Json(serde_json::json!({ "marked": marked })))
}

// ============================================================================
// Enrichment
// ============================================================================

pub async fn translate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    let translated = state
        .orchestrator
        .translate_title(id)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    Ok(Json(serde_json::json!({ "translated_title": translated })))
}

pub async fn summarize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    ensure_article(&state, id).await?;
    let result = state
        .orchestrator
        .summarize_article(id)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    Ok(Json(serde_json::to_value(result).map_err(|e| AppError::Internal(e.to_string()))?))
}

// ============================================================================
// Counts
// ============================================================================

pub async fn unread_counts(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let total = state.db.get_total_unread_count().await?;
    let per_feed = state.db.unread_counts_per_feed().await?;
    Ok(Json(serde_json::json!({ "total": total, "per_feed": per_feed })))
}

pub async fn filter_counts(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let unread = state.db.unread_counts_per_feed().await?;
    let favorites = state.db.favorite_counts_per_feed().await?;
    let read_later = state.db.read_later_counts_per_feed().await?;
    let images = state.db.image_counts_per_feed().await?;

    Ok(Json(serde_json::json!({
        "unread": { "total": unread.values().sum::<i64>(), "per_feed": unread },
        "favorites": { "total": favorites.values().sum::<i64>(), "per_feed": favorites },
        "read_later": { "total": read_later.values().sum::<i64>(), "per_feed": read_later },
        "image_gallery": { "total": images.values().sum::<i64>(), "per_feed": images },
    })))
}

async fn ensure_article(state: &AppState, id: i64) -> AppResult<()> {
    state
        .db
        .get_article_by_id(id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("article {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::state::test_support::test_state;
    use crate::storage::{FeedKind, NewFeed, ParsedArticle};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn seed(state: &AppState) -> (i64, Vec<i64>) {
        let feed_id = state
            .db
            .add_feed(&NewFeed {
                title: "Blog Y".into(),
                url: "https://blog.y/".into(),
                category: "news/world".into(),
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
        let ids = state
            .db
            .save_articles(
                feed_id,
                &[
                    ParsedArticle {
                        title: "I1".into(),
                        url: Some("https://blog.y/1".into()),
                        image_url: None,
                        audio_url: None,
                        published: 1704067200, // 2024-01-01
                        content: Some(r#"<p>text</p><img src="http://cdn.x/a.png"><img src="data:image/png;base64,AA">"#.into()),
                        uid: None,
                    },
                    ParsedArticle {
                        title: "I2".into(),
                        url: Some("https://blog.y/2".into()),
                        image_url: None,
                        audio_url: None,
                        published: 1704153600, // 2024-01-02
                        content: None,
                        uid: None,
                    },
                ],
            )
            .await
            .unwrap();
        (feed_id, ids)
    }

    async fn get_json(
        app: axum::Router,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let (state, _rx) = test_state().await;
        seed(&state).await;

        let (status, value) = get_json(router(state), "/api/articles?filter=all").await;
        assert_eq!(status, StatusCode::OK);
        let titles: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["I2", "I1"]);
    }

    #[tokio::test]
    async fn test_list_unknown_filter_400() {
        let (state, _rx) = test_state().await;
        let (status, _) = get_json(router(state), "/api/articles?filter=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_content_rewrites_remote_images_only() {
        let (state, _rx) = test_state().await;
        let (_feed, ids) = seed(&state).await;

        let (status, value) =
            get_json(router(state), &format!("/api/articles/{}/content", ids[0])).await;
        assert_eq!(status, StatusCode::OK);
        let content = value["content"].as_str().unwrap();

        assert!(!content.contains("http://cdn.x/a.png"), "remote src must be rewritten");
        assert!(content.contains("/api/media?url_b64="));
        assert!(content.contains("data:image/png;base64,AA"), "data URL untouched");

        // The referer parameter decodes back to the owning feed's URL
        let referer_b64 = content
            .split("referer_b64=")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .trim_end_matches('>');
        assert_eq!(
            crate::media::decode_url_b64(referer_b64).as_deref(),
            Some("https://blog.y/")
        );
    }

    #[tokio::test]
    async fn test_images_endpoint_lists_srcs() {
        let (state, _rx) = test_state().await;
        let (_feed, ids) = seed(&state).await;

        let (status, value) =
            get_json(router(state), &format!("/api/articles/{}/images", ids[0])).await;
        assert_eq!(status, StatusCode::OK);
        let urls = value.as_array().unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], "http://cdn.x/a.png");
    }

    #[tokio::test]
    async fn test_flag_toggles() {
        let (state, _rx) = test_state().await;
        let (_feed, ids) = seed(&state).await;
        let app = router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/articles/{}/toggle-favorite", ids[0]),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/articles/{}/read", ids[0]),
                serde_json::json!({ "read": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let article = state.db.get_article_by_id(ids[0]).await.unwrap().unwrap();
        assert!(article.favorite);
        assert!(article.read);
    }

    #[tokio::test]
    async fn test_mark_all_read_scopes() {
        let (state, _rx) = test_state().await;
        seed(&state).await;
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(post_json(
                "/api/articles/mark-all-read",
                serde_json::json!({ "category": "news" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.db.get_total_unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filtered_endpoint_matches_rule_engine() {
        let (state, _rx) = test_state().await;
        seed(&state).await;
        let app = router(Arc::clone(&state));

        let conditions = serde_json::json!({
            "conditions": [
                {"field": "feed_category", "operator": "contains", "value": "news"}
            ]
        });
        let response = app
            .oneshot(post_json("/api/articles/filter", conditions))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let articles: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(articles.len(), 2, "both articles belong to the news feed");
    }

    #[tokio::test]
    async fn test_full_text_fetch_gated_403() {
        let (state, _rx) = test_state().await;
        let (_feed, ids) = seed(&state).await;
        let app = router(state);

        let response = app
            .oneshot(post_json(
                &format!("/api/articles/{}/fetch-full-text", ids[0]),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_filter_counts_shape() {
        let (state, _rx) = test_state().await;
        let (_feed, ids) = seed(&state).await;
        state.db.toggle_favorite(ids[0]).await.unwrap();

        let (status, value) = get_json(router(state), "/api/filter-counts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["unread"]["total"], 2);
        assert_eq!(value["favorites"]["total"], 1);
        assert_eq!(value["read_later"]["total"], 0);
    }
}
