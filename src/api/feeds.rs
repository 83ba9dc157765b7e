use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::storage::{DatabaseError, Feed, FeedKind, NewFeed};
use crate::util::validate_url;

pub async fn list(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Feed>>> {
    Ok(Json(state.db.get_feeds().await?))
}

pub async fn add(
    State(state): State<Arc<AppState>>,
    Json(feed): Json<NewFeed>,
) -> AppResult<Json<Feed>> {
    validate_new_feed(&feed)?;

    let id = state.db.add_feed(&feed).await.map_err(|e| match e {
        DatabaseError::DuplicateUrl(url) => AppError::Conflict(format!("already subscribed: {url}")),
        other => AppError::Internal(other.to_string()),
    })?;

    let created = state
        .db
        .get_feed_by_id(id)
        .await?
        .ok_or_else(|| AppError::Internal("feed vanished after insert".to_owned()))?;
    Ok(Json(created))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(feed): Json<NewFeed>,
) -> AppResult<Json<Feed>> {
    validate_new_feed(&feed)?;

    let changed = state.db.update_feed(id, &feed).await?;
    if !changed {
        // Distinguish "no such feed" from "managed, read-only"
        match state.db.get_feed_by_id(id).await? {
            Some(existing) if existing.managed => {
                return Err(AppError::Forbidden(
                    "managed feeds are read-only".to_owned(),
                ))
            }
            Some(_) => {}
            None => return Err(AppError::NotFound(format!("feed {id}"))),
        }
    }

    state.caches.invalidate_feed(id);
    let updated = state
        .db
        .get_feed_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("feed {id}")))?;
    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state.db.delete_feed(id).await?;
    if !deleted {
        match state.db.get_feed_by_id(id).await? {
            Some(existing) if existing.managed => {
                return Err(AppError::Forbidden(
                    "managed feeds are removed by their sync source".to_owned(),
                ))
            }
            _ => return Err(AppError::NotFound(format!("feed {id}"))),
        }
    }

    state.caches.invalidate_feed(id);
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<i64>,
}

pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchDeleteRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state.db.batch_delete_feeds(&request.ids).await?;
    for id in &request.ids {
        state.caches.invalidate_feed(*id);
    }
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Deserialize)]
pub struct BatchMoveRequest {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub category: String,
}

pub async fn batch_move(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchMoveRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if request.category.starts_with('/') || request.category.ends_with('/') {
        return Err(AppError::InvalidInput(
            "category must not start or end with '/'".to_owned(),
        ));
    }
    let moved = state
        .db
        .batch_move_feeds(&request.ids, &request.category)
        .await?;
    Ok(Json(serde_json::json!({ "moved": moved })))
}

fn validate_new_feed(feed: &NewFeed) -> AppResult<()> {
    if feed.title.trim().is_empty() {
        return Err(AppError::InvalidInput("feed title is required".to_owned()));
    }

    match feed.kind {
        // Script feeds use the URL as an opaque identity; everything that
        // will actually be fetched must be a safe public URL
        FeedKind::Script => {
            if feed.script_path.as_deref().unwrap_or("").trim().is_empty() {
                return Err(AppError::InvalidInput(
                    "script feeds need a script_path".to_owned(),
                ));
            }
        }
        FeedKind::Email => {}
        _ => {
            validate_url(&feed.url).map_err(|e| AppError::InvalidInput(e.to_string()))?;
        }
    }

    if feed.refresh_interval < -1 {
        return Err(AppError::InvalidInput(
            "refresh_interval must be -1 (adaptive), 0 (global) or positive minutes".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn feed_json(url: &str) -> String {
        serde_json::json!({ "title": "Feed", "url": url }).to_string()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list_feed() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(post_json("/api/feeds", feed_json("https://example.com/rss")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/api/feeds").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let feeds: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0]["url"], "https://example.com/rss");
    }

    #[tokio::test]
    async fn test_duplicate_subscription_conflicts() {
        let (state, _rx) = test_state().await;
        let app = router(state);

        let first = app
            .clone()
            .oneshot(post_json("/api/feeds", feed_json("https://example.com/rss")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post_json("/api/feeds", feed_json("https://example.com/rss")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_add_rejects_unsafe_url() {
        let (state, _rx) = test_state().await;
        let app = router(state);

        for url in ["http://127.0.0.1/feed", "file:///etc/passwd", "not a url"] {
            let response = app
                .clone()
                .oneshot(post_json("/api/feeds", feed_json(url)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "url: {url}");
        }
    }

    #[tokio::test]
    async fn test_update_managed_feed_forbidden() {
        let (state, _rx) = test_state().await;
        let mut managed = NewFeed {
            title: "Managed".into(),
            url: "https://managed.example.com/rss".into(),
            category: String::new(),
            image_url: None,
            kind: FeedKind::Rss,
            selectors: Default::default(),
            script_path: None,
            hidden: false,
            image_mode: false,
            proxy_url: None,
            refresh_interval: 0,
            managed: true,
        };
        let id = state.db.add_feed(&managed).await.unwrap();
        managed.title = "Renamed".into();

        let app = router(state);
        let response = app
            .oneshot({
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/feeds/{id}"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_string(&serde_json::json!({
                        "title": "Renamed",
                        "url": "https://managed.example.com/rss"
                    })).unwrap()))
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delete_missing_feed_404() {
        let (state, _rx) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/feeds/424242")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_move_sets_category() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        let a: serde_json::Value = {
            let response = app
                .clone()
                .oneshot(post_json("/api/feeds", feed_json("https://a.example.com/rss")))
                .await
                .unwrap();
            let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        };

        let response = app
            .oneshot(post_json(
                "/api/feeds/batch-move",
                serde_json::json!({ "ids": [a["id"]], "category": "news/world" }).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let moved = state
            .db
            .get_feed_by_id(a["id"].as_i64().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.category, "news/world");
    }
}
