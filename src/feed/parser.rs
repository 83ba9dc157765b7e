use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::storage::{Feed, FeedKind, ParsedArticle};
use crate::util::{strip_control_chars, strip_html, truncate_chars};

use super::{script, xpath};

/// Per-feed fetch deadline
pub const FEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Response body cap; a feed larger than this is broken or hostile
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;
/// Title fallback takes this many characters of the content text
const TITLE_FALLBACK_CHARS: usize = 100;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp"];

/// Errors from fetching or decoding one feed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Network-level error (DNS, connection, TLS)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the 30-second deadline
    #[error("request timed out")]
    Timeout,
    /// Non-2xx HTTP response
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size cap
    #[error("response too large")]
    TooLarge,
    /// Payload is not a parseable RSS/Atom document
    #[error("feed decode error: {0}")]
    Decode(String),
    /// Script-backed feed failed to run or misbehaved
    #[error("script error: {0}")]
    Script(String),
    /// Selector-driven extraction failed
    #[error("selector error: {0}")]
    Selector(String),
    /// Feed kind has no fetch path in this build
    #[error("unsupported feed kind: {0}")]
    Unsupported(&'static str),
}

/// Result of fetching one feed: normalised items plus the source's own
/// metadata, which the fetch layer may copy onto a feed row that lacks it.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub articles: Vec<ParsedArticle>,
}

/// Fetch and normalise one feed according to its kind.
///
/// Honours the per-feed proxy URL and the 30-second deadline. The returned
/// articles preserve source ordering.
pub async fn fetch_feed(
    client: &reqwest::Client,
    feed: &Feed,
    scripts_dir: &Path,
) -> Result<FetchedFeed, ParseError> {
    match feed.kind {
        FeedKind::Rss | FeedKind::Atom | FeedKind::Rsshub => {
            let bytes = fetch_bytes(client, feed, &feed.url).await?;
            parse_feed_bytes(&bytes, &feed.url)
        }
        FeedKind::HtmlXpath | FeedKind::XmlXpath => {
            let bytes = fetch_bytes(client, feed, &feed.url).await?;
            let text = String::from_utf8_lossy(&bytes);
            let articles = xpath::extract(
                &text,
                feed.kind == FeedKind::HtmlXpath,
                &feed.selectors,
                &feed.url,
            )
            .map_err(|e| ParseError::Selector(e.to_string()))?;
            Ok(FetchedFeed {
                title: None,
                image_url: None,
                articles,
            })
        }
        FeedKind::Script => script::run_script_feed(feed, scripts_dir).await,
        FeedKind::Email => Err(ParseError::Unsupported("email")),
    }
}

/// GET with deadline, size cap and optional per-feed proxy.
async fn fetch_bytes(
    client: &reqwest::Client,
    feed: &Feed,
    url: &str,
) -> Result<Vec<u8>, ParseError> {
    // A per-feed proxy needs its own client; reqwest proxies are
    // client-level configuration.
    let proxied;
    let client = match feed.proxy_url.as_deref().filter(|p| !p.is_empty()) {
        Some(proxy_url) => {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(ParseError::Network)?;
            proxied = reqwest::Client::builder()
                .proxy(proxy)
                .build()
                .map_err(ParseError::Network)?;
            &proxied
        }
        None => client,
    };

    let response = tokio::time::timeout(FEED_FETCH_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| ParseError::Timeout)?
        .map_err(ParseError::Network)?;

    if !response.status().is_success() {
        return Err(ParseError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, MAX_FEED_SIZE).await
}

/// Stream the body with an upper bound instead of trusting Content-Length.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, ParseError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ParseError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ParseError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ParseError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

/// Parse raw RSS/Atom/RDF bytes into normalised articles.
///
/// `base_url` anchors relative link and image resolution, typically the
/// feed's own URL.
pub fn parse_feed_bytes(bytes: &[u8], base_url: &str) -> Result<FetchedFeed, ParseError> {
    let parsed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::Decode(e.to_string()))?;

    let feed_title = parsed
        .title
        .map(|t| strip_control_chars(t.content.trim()).into_owned())
        .filter(|t| !t.is_empty());
    let feed_image = parsed
        .logo
        .map(|i| i.uri)
        .or_else(|| parsed.icon.map(|i| i.uri));

    let now = chrono::Utc::now().timestamp();
    let articles = parsed
        .entries
        .into_iter()
        .map(|entry| normalize_entry(entry, base_url, now))
        .collect();

    Ok(FetchedFeed {
        title: feed_title,
        image_url: feed_image,
        articles,
    })
}

/// Apply the normalisation rules to one feed entry.
fn normalize_entry(entry: feed_rs::model::Entry, base_url: &str, now: i64) -> ParsedArticle {
    let url = entry
        .links
        .first()
        .map(|l| l.href.trim().to_owned())
        .filter(|href| !href.is_empty());

    let summary = entry.summary.map(|s| s.content);
    let body = entry.content.and_then(|c| c.body);
    // Content wins over the summary as the stored body; either serves as
    // the text source for the title fallback.
    let content = body.clone().or_else(|| summary.clone());

    let mut title = entry
        .title
        .map(|t| strip_control_chars(t.content.trim()).into_owned())
        .unwrap_or_default();
    if title.is_empty() {
        if let Some(text_source) = content.as_deref() {
            let text = strip_html(text_source);
            title = truncate_chars(text.trim(), TITLE_FALLBACK_CHARS);
        }
    }
    if title.is_empty() {
        title = url.clone().unwrap_or_default();
    }

    // Published → updated → insertion time; always UTC
    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp())
        .unwrap_or(now);

    // Relative image URLs resolve against the item's own URL when present,
    // else the feed URL
    let resolve_base = url.as_deref().unwrap_or(base_url);

    let image_url = first_image_enclosure(&entry.media)
        .or_else(|| first_media_thumbnail(&entry.media))
        .or_else(|| {
            content
                .as_deref()
                .and_then(|html| first_image_in_html(html, resolve_base))
        })
        .map(|src| resolve_url(resolve_base, &src));

    let audio_url = entry.media.iter().find_map(|media| {
        media.content.iter().find_map(|c| {
            let is_audio = c
                .content_type
                .as_ref()
                .map(|ct| ct.to_string().starts_with("audio/"))
                .unwrap_or(false);
            if is_audio {
                c.url.as_ref().map(|u| u.to_string())
            } else {
                None
            }
        })
    });

    ParsedArticle {
        title,
        url,
        image_url,
        audio_url,
        published,
        content,
        uid: None,
    }
}

/// First enclosure that is recognisably an image (png/jpeg/gif/webp).
fn first_image_enclosure(media: &[feed_rs::model::MediaObject]) -> Option<String> {
    media.iter().find_map(|m| {
        m.content.iter().find_map(|c| {
            let url = c.url.as_ref()?.to_string();
            let by_type = c
                .content_type
                .as_ref()
                .map(|ct| ct.to_string().starts_with("image/"))
                .unwrap_or(false);
            let lower = url.to_lowercase();
            let by_ext = IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext));
            if by_type || by_ext {
                Some(url)
            } else {
                None
            }
        })
    })
}

fn first_media_thumbnail(media: &[feed_rs::model::MediaObject]) -> Option<String> {
    media
        .iter()
        .find_map(|m| m.thumbnails.first().map(|t| t.image.uri.clone()))
}

/// First `<img src>` in an HTML fragment.
fn first_image_in_html(html: &str, _base: &str) -> Option<String> {
    let fragment = scraper::Html::parse_fragment(html);
    let selector = scraper::Selector::parse("img").ok()?;
    fragment
        .select(&selector)
        .find_map(|img| img.value().attr("src"))
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Resolve a possibly-relative URL against a base. Unresolvable inputs are
/// returned untouched; downstream fetch will fail loudly instead.
pub(crate) fn resolve_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") || href.starts_with("data:") {
        return href.to_owned();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    if let Ok(base) = Url::parse(base) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }
    href.to_owned()
}
