use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::rules::{apply_rule, load_rules, Rule};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ApplyRequest {
    /// Apply a rule from the stored list by index…
    pub index: Option<usize>,
    /// …or an ad-hoc rule supplied inline
    pub rule: Option<Rule>,
}

/// Run a rule over the whole article set, returning how many matched.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApplyRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let rule = match (request.rule, request.index) {
        (Some(rule), _) => rule,
        (None, Some(index)) => {
            let rules = load_rules(&state.db)
                .await
                .map_err(|e| AppError::Decode(format!("stored rules: {e}")))?;
            rules
                .into_iter()
                .nth(index)
                .ok_or_else(|| AppError::NotFound(format!("rule index {index}")))?
        }
        (None, None) => {
            return Err(AppError::InvalidInput(
                "provide either `rule` or `index`".to_owned(),
            ))
        }
    };

    let affected = apply_rule(&state.db, &rule, None).await?;
    Ok(Json(serde_json::json!({ "affected": affected })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::state::test_support::test_state;
    use crate::storage::{ArticleFilter, FeedKind, NewFeed, ParsedArticle, SettingKey};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn seed(state: &crate::state::AppState) -> Vec<i64> {
        let feed_id = state
            .db
            .add_feed(&NewFeed {
                title: "World".into(),
                url: "https://news.example.com/rss".into(),
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
        state
            .db
            .save_articles(
                feed_id,
                &[ParsedArticle {
                    title: "Big story".into(),
                    url: Some("https://news.example.com/1".into()),
                    image_url: None,
                    audio_url: None,
                    published: 100,
                    content: None,
                    uid: None,
                }],
            )
            .await
            .unwrap()
    }

    fn apply_body(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/rules/apply")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_inline_rule_returns_affected() {
        let (state, _rx) = test_state().await;
        let ids = seed(&state).await;
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(apply_body(serde_json::json!({
                "rule": {
                    "name": "fav news",
                    "conditions": [
                        {"field": "feed_category", "operator": "contains", "value": "news"}
                    ],
                    "actions": ["favorite"]
                }
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["affected"], 1);

        let article = state.db.get_article_by_id(ids[0]).await.unwrap().unwrap();
        assert!(article.favorite);
    }

    #[tokio::test]
    async fn test_apply_stored_rule_by_index() {
        let (state, _rx) = test_state().await;
        seed(&state).await;
        state
            .db
            .set_setting(
                SettingKey::Rules,
                &serde_json::json!([{
                    "name": "hide all",
                    "conditions": [],
                    "actions": ["hide"]
                }])
                .to_string(),
            )
            .await
            .unwrap();

        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(apply_body(serde_json::json!({ "index": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let visible = state
            .db
            .get_articles(ArticleFilter::All, None, None, false, 100, 0)
            .await
            .unwrap();
        assert!(visible.is_empty(), "empty-condition rule matches all");
    }

    #[tokio::test]
    async fn test_apply_without_rule_or_index_400() {
        let (state, _rx) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(apply_body(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_apply_missing_index_404() {
        let (state, _rx) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(apply_body(serde_json::json!({ "index": 7 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
