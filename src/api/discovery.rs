use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::feed::discovery::{discover_all, DiscoverySnapshot};
use crate::state::AppState;
use crate::util::validate_url;

#[derive(Deserialize)]
pub struct StartRequest {
    pub url: String,
    /// When set, expand through the site's friends/blogroll page as well
    #[serde(default)]
    pub expand: bool,
}

/// Kick off discovery in the background; progress is observed by polling.
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> AppResult<Json<serde_json::Value>> {
    validate_url(&request.url).map_err(|e| AppError::InvalidInput(e.to_string()))?;

    if !state.discovery.start("seed") {
        return Err(AppError::Conflict("discovery already running".to_owned()));
    }

    let seed = request.url.clone();
    let expand = request.expand;
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        if expand {
            discover_all(&task_state.client, &seed, &task_state.discovery).await;
        } else {
            match crate::feed::discovery::discover_feed(&task_state.client, &seed).await {
                Ok(feed) => {
                    task_state.discovery.add_found(feed);
                    task_state.discovery.finish("discovery finished, 1 feed found");
                }
                Err(e) => {
                    task_state
                        .discovery
                        .finish(&format!("discovery failed: {e}"));
                }
            }
        }
    });

    Ok(Json(serde_json::json!({ "status": "discovery started" })))
}

pub async fn progress(State(state): State<Arc<AppState>>) -> Json<DiscoverySnapshot> {
    Json(state.discovery.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_start_rejects_invalid_seed() {
        let (state, _rx) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/discovery/start")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "url": "http://127.0.0.1/x" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_progress_snapshot_shape() {
        let (state, _rx) = test_state().await;
        state.discovery.start("seed");
        state.discovery.set_stage("probing", "x", 1, 3);

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/discovery/progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["running"], true);
        assert_eq!(value["stage"], "probing");
        assert_eq!(value["total"], 3);
    }

    #[tokio::test]
    async fn test_second_start_conflicts_while_running() {
        let (state, _rx) = test_state().await;
        state.discovery.start("seed");

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/discovery/start")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "url": "https://example.com" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
