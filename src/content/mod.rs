//! Full-article content extraction.
//!
//! When a feed only ships a teaser, the reader can pull the article page
//! and keep the readable part. Extraction is a paragraph-density pass over
//! the DOM: the container with the most paragraph text and the lowest link
//! density wins, boilerplate tags are dropped first.

mod readability;

pub use readability::extract_readable;

use std::time::Duration;

use crate::util::validate_url;

/// Full-article fetch deadline
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024;

/// Fetch an article page and extract its readable body as HTML.
pub async fn fetch_full_text(
    client: &reqwest::Client,
    url: &str,
) -> Result<String, crate::error::AppError> {
    use crate::error::AppError;
    use futures::StreamExt;

    validate_url(url).map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let response = tokio::time::timeout(FETCH_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| AppError::Upstream("full-text fetch timed out".to_owned()))?
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "article page returned {}",
            response.status()
        )));
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::Upstream(e.to_string()))?;
        if bytes.len().saturating_add(chunk.len()) > MAX_PAGE_SIZE {
            return Err(AppError::Upstream("article page too large".to_owned()));
        }
        bytes.extend_from_slice(&chunk);
    }

    let html = String::from_utf8_lossy(&bytes);
    extract_readable(&html).ok_or_else(|| AppError::Decode("no readable content found".to_owned()))
}
