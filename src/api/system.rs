use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::fetch::{FetchJob, ProgressSnapshot, SpeedDetector};
use crate::state::AppState;
use crate::util::validate_url_for_open;

// ============================================================================
// Refresh & progress
// ============================================================================

#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    /// Refresh a single feed; absent means all
    pub feed_id: Option<i64>,
}

/// Kick off a refresh. Always answers 200 "refresh started": the running
/// flag is set before this returns, so the very next progress poll sees
/// it, and completion is observed by polling.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AppResult<Json<serde_json::Value>> {
    let request = parse_optional_body::<RefreshRequest>(request).await?;

    let feeds = match request.feed_id {
        Some(feed_id) => {
            let feed = state
                .db
                .get_feed_by_id(feed_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("feed {feed_id}")))?;
            vec![feed]
        }
        None => state.db.get_feeds().await?,
    };

    // Running flag first — synchronously — then hand work to the channel
    // from a task so a full queue never delays this response
    state.task_manager.start_batch(feeds.len());

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        for feed in feeds {
            if task_state.job_tx.send(FetchJob { feed }).await.is_err() {
                break; // shutting down
            }
        }
    });

    Ok(Json(serde_json::json!({ "status": "refresh started" })))
}

pub async fn progress(State(state): State<Arc<AppState>>) -> Json<ProgressSnapshot> {
    Json(state.task_manager.snapshot())
}

/// These endpoints accept an empty body as "defaults"; anything present
/// must be valid JSON.
async fn parse_optional_body<T: serde::de::DeserializeOwned + Default>(
    request: axum::extract::Request,
) -> AppResult<T> {
    let bytes = axum::body::to_bytes(request.into_body(), 1 << 20)
        .await
        .map_err(|e| AppError::InvalidInput(format!("unreadable body: {e}")))?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| AppError::InvalidInput(format!("bad JSON body: {e}")))
}

// ============================================================================
// Cleanup
// ============================================================================

#[derive(Deserialize, Default)]
pub struct CleanupRequest {
    /// Drop every article regardless of age (favourites included)
    #[serde(default)]
    pub all: bool,
    /// Drop read, unpinned articles regardless of age
    #[serde(default)]
    pub unimportant: bool,
}

pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AppResult<Json<serde_json::Value>> {
    let request = parse_optional_body::<CleanupRequest>(request).await?;

    let removed = if request.all {
        state.db.delete_all_articles().await?
    } else if request.unimportant {
        state.db.cleanup_unimportant_articles().await?
    } else {
        state.db.cleanup_old_articles().await?
    };

    state.caches.article_html.clear();
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn cleanup_content(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let removed = state.db.cleanup_all_article_contents().await?;
    state.caches.article_html.clear();
    if let Err(e) = state.media_cache.clear() {
        tracing::warn!(error = %e, "media cache clear failed");
    }
    Ok(Json(serde_json::json!({ "removed": removed })))
}

// ============================================================================
// Network speed
// ============================================================================

/// Re-run detection on demand and resize the worker gate.
pub async fn speed_test(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let detector = SpeedDetector::new(state.client.clone());
    let tier = detector.detect().await;
    state.gate.set_limit(tier.max_concurrency());
    Json(serde_json::json!({
        "tier": tier,
        "max_concurrency": tier.max_concurrency(),
    }))
}

// ============================================================================
// Browser
// ============================================================================

#[derive(Deserialize)]
pub struct OpenRequest {
    pub url: String,
}

/// Open a link for the user: through the host opener when the deployment
/// allows it, otherwise as a redirect payload the client follows itself.
pub async fn open_browser(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenRequest>,
) -> AppResult<Json<serde_json::Value>> {
    validate_url_for_open(&request.url).map_err(|e| AppError::InvalidInput(e.to_owned()))?;

    if state.config.open_in_browser {
        let url = request.url.clone();
        let opened = tokio::task::spawn_blocking(move || open::that(&url))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        if let Err(e) = opened {
            tracing::warn!(error = %e, "host opener failed, falling back to redirect");
            return Ok(Json(serde_json::json!({ "redirect": request.url })));
        }
        return Ok(Json(serde_json::json!({ "opened": true })));
    }

    Ok(Json(serde_json::json!({ "redirect": request.url })))
}

// ============================================================================
// Updates
// ============================================================================

const UPDATE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_UPDATE_BYTES: usize = 200 * 1024 * 1024;
const ALLOWED_UPDATE_EXTENSIONS: &[&str] = &[".zip", ".tar.gz", ".dmg", ".exe", ".appimage"];

pub async fn check_updates(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let url = format!(
        "https://api.github.com/repos/{}/releases/latest",
        state.config.update_repo
    );

    let response = tokio::time::timeout(
        UPDATE_TIMEOUT,
        state
            .client
            .get(&url)
            .header("User-Agent", "trawl")
            .header("Accept", "application/vnd.github+json")
            .send(),
    )
    .await
    .map_err(|_| AppError::Upstream("update check timed out".to_owned()))?
    .map_err(|e| AppError::Upstream(e.to_string()))?;

    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "releases API returned {}",
            response.status()
        )));
    }

    let release: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Decode(e.to_string()))?;

    let latest = release["tag_name"].as_str().unwrap_or("").trim_start_matches('v');
    let current = env!("CARGO_PKG_VERSION");
    let assets: Vec<serde_json::Value> = release["assets"]
        .as_array()
        .map(|assets| {
            assets
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "name": a["name"],
                        "url": a["browser_download_url"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(serde_json::json!({
        "current": current,
        "latest": latest,
        "update_available": version_newer(latest, current),
        "assets": assets,
    })))
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub asset_name: String,
}

pub async fn download_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> AppResult<Json<serde_json::Value>> {
    // Fail closed on anything outside the project's release downloads
    if !valid_download_url(&state.config.update_repo, &request.url) {
        return Err(AppError::InvalidInput(
            "download URL is not under the project's releases".to_owned(),
        ));
    }
    if !valid_asset_name(&request.asset_name) {
        return Err(AppError::InvalidInput("invalid asset name".to_owned()));
    }

    let response = tokio::time::timeout(UPDATE_TIMEOUT, state.client.get(&request.url).send())
        .await
        .map_err(|_| AppError::Upstream("download timed out".to_owned()))?
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "download returned {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    if bytes.len() > MAX_UPDATE_BYTES {
        return Err(AppError::Upstream("update asset too large".to_owned()));
    }

    let dir = state.config.updates_dir();
    std::fs::create_dir_all(&dir).map_err(|e| AppError::Internal(e.to_string()))?;
    let path = dir.join(&request.asset_name);
    std::fs::write(&path, &bytes).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(serde_json::json!({ "path": path })))
}

#[derive(Deserialize)]
pub struct InstallRequest {
    pub path: String,
}

/// Validate a downloaded asset before the host-side installer glue takes
/// over. Every check fails closed.
pub async fn install_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InstallRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if !allowed_extension(&request.path) {
        return Err(AppError::InvalidInput(
            "unsupported installer extension".to_owned(),
        ));
    }

    let updates_dir = state
        .config
        .updates_dir()
        .canonicalize()
        .map_err(|e| AppError::InvalidInput(format!("updates directory: {e}")))?;
    let path = Path::new(&request.path)
        .canonicalize()
        .map_err(|e| AppError::InvalidInput(format!("installer path: {e}")))?;

    if !path.starts_with(&updates_dir) {
        return Err(AppError::InvalidInput(
            "installer must live inside the updates directory".to_owned(),
        ));
    }

    Ok(Json(serde_json::json!({ "status": "ready", "path": path })))
}

/// Only downloads under the project's own releases path are acceptable.
fn valid_download_url(repo: &str, url: &str) -> bool {
    url.starts_with(&format!("https://github.com/{repo}/releases/download/"))
}

fn valid_asset_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

fn allowed_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    ALLOWED_UPDATE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Dotted-numeric comparison, lenient about non-numeric fragments.
fn version_newer(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let c = parse(candidate);
    let cur = parse(current);
    if c.is_empty() {
        return false;
    }
    c > cur
}
