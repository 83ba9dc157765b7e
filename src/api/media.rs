use axum::extract::{Query, State};
use axum::http::header::{CONTENT_TYPE, REFERER};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::media::{decode_url_b64, MAX_CACHEABLE_BYTES};
use crate::state::AppState;
use crate::storage::SettingKey;
use crate::util::validate_url;

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);
/// The proxy will stream through larger files, it just will not cache them
const MAX_PROXY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Deserialize)]
pub struct ProxyParams {
    pub url_b64: String,
    pub referer_b64: Option<String>,
}

/// Fetch a remote resource on the renderer's behalf, replaying the owning
/// feed's URL as the Referer, with an optional disk cache for images.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProxyParams>,
) -> AppResult<Response> {
    let url = decode_url_b64(&params.url_b64)
        .ok_or_else(|| AppError::InvalidInput("url_b64 is not valid base64".to_owned()))?;
    let referer = params
        .referer_b64
        .as_deref()
        .and_then(decode_url_b64);

    // The decoded URL is attacker-influencable via stored feed HTML; it
    // gets the same SSRF screening as a subscribe target
    validate_url(&url).map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let cache_enabled = state.db.setting_bool(SettingKey::MediaCacheEnabled).await?;

    if cache_enabled {
        if let Some((bytes, content_type)) = state.media_cache.get(&url) {
            return Ok(([(CONTENT_TYPE, content_type)], bytes).into_response());
        }
    }

    let mut request = state.client.get(&url);
    if let Some(referer) = &referer {
        request = request.header(REFERER, referer);
    }

    let response = tokio::time::timeout(PROXY_TIMEOUT, request.send())
        .await
        .map_err(|_| AppError::Upstream("media fetch timed out".to_owned()))?
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "remote returned {}",
            response.status()
        )));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();

    let bytes = read_limited(response).await?;

    // Cache images only; errors and oversize bodies never enter the cache
    if cache_enabled && content_type.starts_with("image/") && bytes.len() <= MAX_CACHEABLE_BYTES {
        let max_mb = state.db.setting_i64(SettingKey::MaxCacheSizeMb).await?.max(1) as u64;
        if let Err(e) = state.media_cache.put(&url, &content_type, &bytes, max_mb) {
            tracing::warn!(error = %e, "media cache write failed");
        }
    }

    Ok(([(CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn read_limited(response: reqwest::Response) -> AppResult<Vec<u8>> {
    use futures::StreamExt;

    if let Some(len) = response.content_length() {
        if len as usize > MAX_PROXY_BYTES {
            return Err(AppError::Upstream("media resource too large".to_owned()));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::Upstream(e.to_string()))?;
        if bytes.len().saturating_add(chunk.len()) > MAX_PROXY_BYTES {
            return Err(AppError::Upstream("media resource too large".to_owned()));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
