//! Feed autodiscovery.
//!
//! Given a seed URL: look for `<link rel="alternate">` in the page head,
//! fall back to probing the common feed paths, and validate candidates
//! HEAD-first. A second stage walks a "friends"/blogroll page on the same
//! site, filters out social and aggregator hosts, and retries discovery on
//! every remaining candidate. Progress is published through a shared
//! [`DiscoveryState`] the HTTP layer polls.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::{strip_control_chars, validate_url};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DISCOVERY_SIZE: usize = 5 * 1024 * 1024;
/// Common feed locations probed when the page declares none
const COMMON_FEED_PATHS: &[&str] = &[
    "/feed",
    "/rss",
    "/atom.xml",
    "/feed.xml",
    "/rss.xml",
    "/index.xml",
];
/// Hosts that are link aggregators or social platforms, never personal feeds
const EXCLUDED_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "youtube.com",
    "weibo.com",
    "zhihu.com",
    "github.com",
    "t.me",
    "linkedin.com",
    "medium.com",
    "reddit.com",
];
/// Path fragments that usually mark a blogroll page
const FRIEND_PAGE_PATHS: &[&str] = &["/friends", "/links", "/blogroll", "/friend", "/link"];

/// A feed located by discovery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredFeed {
    pub title: String,
    pub feed_url: String,
    pub site_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("not a feed: no RSS/Atom content found")]
    NotAFeed,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("response too large")]
    TooLarge,
}

// ============================================================================
// Progress state
// ============================================================================

/// Snapshot of a running discovery, value-copied for the progress endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DiscoverySnapshot {
    pub running: bool,
    pub stage: String,
    pub message: String,
    pub current: usize,
    pub total: usize,
    pub found: Vec<DiscoveredFeed>,
}

/// Shared discovery progress. All exported operations are atomic; the HTTP
/// layer only ever sees value snapshots.
#[derive(Default)]
pub struct DiscoveryState {
    inner: Mutex<DiscoverySnapshot>,
}

impl DiscoveryState {
    pub fn start(&self, stage: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.running {
            return false;
        }
        *inner = DiscoverySnapshot {
            running: true,
            stage: stage.to_owned(),
            ..Default::default()
        };
        true
    }

    pub fn set_stage(&self, stage: &str, message: &str, current: usize, total: usize) {
        let mut inner = self.inner.lock();
        inner.stage = stage.to_owned();
        inner.message = message.to_owned();
        inner.current = current;
        inner.total = total;
    }

    pub fn add_found(&self, feed: DiscoveredFeed) {
        self.inner.lock().found.push(feed);
    }

    pub fn finish(&self, message: &str) {
        let mut inner = self.inner.lock();
        inner.running = false;
        inner.stage = "done".to_owned();
        inner.message = message.to_owned();
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        self.inner.lock().clone()
    }
}

// ============================================================================
// Single-site discovery
// ============================================================================

/// Discover a feed from a URL that may be the feed itself or an HTML page.
pub async fn discover_feed(
    client: &reqwest::Client,
    url: &str,
) -> Result<DiscoveredFeed, DiscoveryError> {
    let validated = validate_url(url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    fetch_and_discover(client, validated.as_str()).await
}

async fn fetch_and_discover(
    client: &reqwest::Client,
    url_str: &str,
) -> Result<DiscoveredFeed, DiscoveryError> {
    let response = tokio::time::timeout(PROBE_TIMEOUT, client.get(url_str).send())
        .await
        .map_err(|_| DiscoveryError::Timeout)?
        .map_err(DiscoveryError::Network)?;

    if !response.status().is_success() {
        return Err(DiscoveryError::NotAFeed);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let is_xml = content_type.contains("xml");
    let is_html = content_type.contains("text/html") || content_type.contains("xhtml");

    let bytes = read_limited(response).await?;

    if is_xml {
        return parse_feed_metadata(&bytes, url_str);
    }

    if is_html {
        return discover_from_html(client, &bytes, url_str).await;
    }

    // Ambiguous Content-Type: try the feed parse first, then the HTML scan
    if let Ok(feed) = parse_feed_metadata(&bytes, url_str) {
        return Ok(feed);
    }
    discover_from_html(client, &bytes, url_str).await
}

async fn read_limited(response: reqwest::Response) -> Result<Vec<u8>, DiscoveryError> {
    use futures::StreamExt;

    if let Some(len) = response.content_length() {
        if len as usize > MAX_DISCOVERY_SIZE {
            return Err(DiscoveryError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DiscoveryError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > MAX_DISCOVERY_SIZE {
            return Err(DiscoveryError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn parse_feed_metadata(bytes: &[u8], feed_url: &str) -> Result<DiscoveredFeed, DiscoveryError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|_| DiscoveryError::NotAFeed)?;

    let title = strip_control_chars(
        &feed
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled Feed".to_owned()),
    )
    .into_owned();

    let site_url = feed
        .links
        .iter()
        .find(|link| link.href != feed_url)
        .or_else(|| feed.links.first())
        .map(|link| strip_control_chars(&link.href).into_owned())
        .filter(|href| href != feed_url);

    Ok(DiscoveredFeed {
        title,
        feed_url: feed_url.to_owned(),
        site_url,
    })
}

async fn discover_from_html(
    client: &reqwest::Client,
    html_bytes: &[u8],
    base_url: &str,
) -> Result<DiscoveredFeed, DiscoveryError> {
    let html = String::from_utf8_lossy(html_bytes);

    // Declared feed link wins; otherwise probe the usual suspects. The
    // declared href is page-controlled and gets its own SSRF check; the
    // common paths are same-origin with the already-validated base.
    let candidates: Vec<String> = match find_feed_link_in_html(&html, base_url) {
        Some(href) if validate_url(&href).is_ok() => vec![href],
        Some(_) => Vec::new(),
        None => common_path_candidates(base_url),
    };

    for candidate in candidates {
        if let Ok(Some(feed)) = probe_candidate(client, &candidate).await {
            let mut feed = feed;
            if feed.site_url.is_none() {
                feed.site_url = Some(base_url.to_owned());
            }
            return Ok(feed);
        }
    }

    Err(DiscoveryError::NotAFeed)
}

/// HEAD first to skip obvious non-feeds cheaply, then GET and sniff.
async fn probe_candidate(
    client: &reqwest::Client,
    url: &str,
) -> Result<Option<DiscoveredFeed>, DiscoveryError> {
    let head = tokio::time::timeout(PROBE_TIMEOUT, client.head(url).send()).await;
    if let Ok(Ok(response)) = head {
        if response.status().is_success() {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_lowercase();
            // A HEAD that answers text/html is not a feed; anything else
            // (xml, octet-stream, missing) is worth the GET
            if content_type.contains("text/html") {
                return Ok(None);
            }
        } else {
            return Ok(None);
        }
    }

    let response = tokio::time::timeout(PROBE_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| DiscoveryError::Timeout)?
        .map_err(DiscoveryError::Network)?;
    if !response.status().is_success() {
        return Ok(None);
    }
    let bytes = read_limited(response).await?;
    Ok(parse_feed_metadata(&bytes, url).ok())
}

fn common_path_candidates(base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    COMMON_FEED_PATHS
        .iter()
        .filter_map(|path| base.join(path).ok())
        .map(|u| u.to_string())
        .collect()
}

// ============================================================================
// Friend-links expansion
// ============================================================================

/// Discover feeds from the seed site and from its blogroll neighbours,
/// publishing progress into `state` as it goes.
pub async fn discover_all(client: &reqwest::Client, seed_url: &str, state: &DiscoveryState) {
    state.set_stage("seed", "checking the seed site", 0, 1);

    let seed_feed = match discover_feed(client, seed_url).await {
        Ok(feed) => {
            state.add_found(feed.clone());
            Some(feed)
        }
        Err(e) => {
            tracing::debug!(url = %seed_url, error = %e, "seed discovery failed");
            None
        }
    };

    let site_url = seed_feed
        .and_then(|f| f.site_url)
        .unwrap_or_else(|| seed_url.to_owned());

    state.set_stage("friends", "looking for a friends page", 0, 0);
    let candidates = match find_friend_links(client, &site_url).await {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(url = %site_url, error = %e, "friend page scan failed");
            Vec::new()
        }
    };

    let total = candidates.len();
    for (i, candidate) in candidates.into_iter().enumerate() {
        state.set_stage("probing", &candidate, i + 1, total);
        match discover_feed(client, &candidate).await {
            Ok(feed) => state.add_found(feed),
            Err(e) => tracing::debug!(url = %candidate, error = %e, "candidate had no feed"),
        }
    }

    let found = state.snapshot().found.len();
    state.finish(&format!("discovery finished, {found} feed(s) found"));
}

/// Fetch the site's friends/blogroll page and collect outbound site links.
async fn find_friend_links(
    client: &reqwest::Client,
    site_url: &str,
) -> Result<Vec<String>, DiscoveryError> {
    let base = Url::parse(site_url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    let own_host = base.host_str().unwrap_or_default().to_owned();

    for path in FRIEND_PAGE_PATHS {
        let Ok(page_url) = base.join(path) else {
            continue;
        };
        let response =
            match tokio::time::timeout(PROBE_TIMEOUT, client.get(page_url.as_str()).send()).await {
                Ok(Ok(r)) if r.status().is_success() => r,
                _ => continue,
            };
        let bytes = read_limited(response).await?;
        let html = String::from_utf8_lossy(&bytes);
        let links = outbound_links(&html, &own_host);
        if !links.is_empty() {
            return Ok(links);
        }
    }

    Ok(Vec::new())
}

/// External `<a href>` targets, one per host, social/aggregator hosts
/// dropped, normalised to the site root.
fn outbound_links(html: &str, own_host: &str) -> Vec<String> {
    let doc = scraper::Html::parse_document(html);
    let Ok(selector) = scraper::Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen_hosts = HashSet::new();
    let mut links = Vec::new();

    for a in doc.select(&selector) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let Ok(url) = Url::parse(href) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        let Some(host) = url.host_str() else {
            continue;
        };
        if host == own_host || !seen_hosts.insert(host.to_owned()) {
            continue;
        }
        let bare = host.trim_start_matches("www.");
        if EXCLUDED_DOMAINS
            .iter()
            .any(|d| bare == *d || bare.ends_with(&format!(".{d}")))
        {
            continue;
        }
        links.push(format!("{}://{}/", url.scheme(), host));
    }

    links
}

// ============================================================================
// HTML head scanning
// ============================================================================

/// Media types a declared feed `<link>` may carry.
const FEED_LINK_TYPES: &[&str] = &["application/rss+xml", "application/atom+xml"];

/// Find the page's declared feed: the first
/// `<link rel="alternate" type="application/rss+xml|atom+xml" href=…>`.
///
/// Same DOM pass as [`outbound_links`]; the parser absorbs attribute order,
/// quoting style and tag-soup so none of that needs handling here. `rel` is
/// a space-separated token list per HTML, so `rel="alternate nofollow"`
/// still qualifies. The href resolves against the page URL.
fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    let doc = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("link[rel][type][href]").ok()?;

    doc.select(&selector)
        .map(|link| link.value())
        .filter(|el| {
            el.attr("rel")
                .unwrap_or("")
                .split_whitespace()
                .any(|token| token.eq_ignore_ascii_case("alternate"))
        })
        .filter(|el| {
            let declared = el.attr("type").unwrap_or("").trim();
            FEED_LINK_TYPES
                .iter()
                .any(|t| declared.eq_ignore_ascii_case(t))
        })
        .find_map(|el| {
            let href = el.attr("href")?.trim();
            if href.is_empty() {
                return None;
            }
            Some(super::parser::resolve_url(base_url, href))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example Blog</title>
  <link>https://example.com</link>
  <item><title>Post</title><link>https://example.com/post/1</link></item>
</channel></rss>"#;

    #[test]
    fn test_find_feed_link_variants() {
        let cases = [
            r#"<link rel="alternate" type="application/rss+xml" href="/feed.xml">"#,
            r#"<link href="/feed.xml" type="application/rss+xml" rel="alternate">"#,
            r#"<link rel='alternate' type='application/rss+xml' href='/feed.xml'>"#,
        ];
        for tag in cases {
            let html = format!("<html><head>{tag}</head></html>");
            assert_eq!(
                find_feed_link_in_html(&html, "https://example.com"),
                Some("https://example.com/feed.xml".to_owned()),
                "failed on {tag}"
            );
        }
    }

    #[test]
    fn test_find_feed_link_absent() {
        let html = r#"<html><head><link rel="stylesheet" href="/s.css"></head></html>"#;
        assert_eq!(find_feed_link_in_html(html, "https://example.com"), None);
    }

    #[test]
    fn test_find_feed_link_rel_token_list_and_case() {
        // rel is a token list and type matching is case-insensitive
        let html = r#"<html><head>
            <link rel="alternate nofollow" type="Application/RSS+XML" href="/feed.xml">
        </head></html>"#;
        assert_eq!(
            find_feed_link_in_html(html, "https://example.com"),
            Some("https://example.com/feed.xml".to_owned())
        );
    }

    #[test]
    fn test_find_feed_link_ignores_empty_href() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="">
            <link rel="alternate" type="application/atom+xml" href="/atom.xml">
        </head></html>"#;
        assert_eq!(
            find_feed_link_in_html(html, "https://example.com"),
            Some("https://example.com/atom.xml".to_owned())
        );
    }

    #[test]
    fn test_outbound_links_filtering() {
        let html = r#"<html><body>
            <a href="https://friend.example.org/about">friend</a>
            <a href="https://friend.example.org/other">same host again</a>
            <a href="https://twitter.com/someone">social</a>
            <a href="https://www.github.com/someone">aggregator</a>
            <a href="https://self.example.com/page">self</a>
            <a href="/relative">relative</a>
            <a href="mailto:x@example.com">mail</a>
        </body></html>"#;

        let links = outbound_links(html, "self.example.com");
        assert_eq!(links, vec!["https://friend.example.org/".to_owned()]);
    }

    #[test]
    fn test_parse_feed_metadata() {
        let feed = parse_feed_metadata(RSS.as_bytes(), "https://example.com/feed.xml").unwrap();
        assert_eq!(feed.title, "Example Blog");
        assert!(feed.site_url.as_deref().unwrap().starts_with("https://example.com"));
    }

    #[test]
    fn test_discovery_state_snapshot_lifecycle() {
        let state = DiscoveryState::default();
        assert!(state.start("seed"));
        assert!(!state.start("seed"), "double start is refused while running");

        state.set_stage("probing", "x", 2, 5);
        state.add_found(DiscoveredFeed {
            title: "T".into(),
            feed_url: "https://example.com/rss".into(),
            site_url: None,
        });

        let snap = state.snapshot();
        assert!(snap.running);
        assert_eq!(snap.current, 2);
        assert_eq!(snap.found.len(), 1);

        state.finish("done");
        let snap = state.snapshot();
        assert!(!snap.running);
        assert!(state.start("again"), "finished state can restart");
    }

    #[tokio::test]
    async fn test_discover_rejects_private_urls() {
        let client = reqwest::Client::new();
        let result = discover_feed(&client, "http://192.168.1.1/feed").await;
        assert!(matches!(result, Err(DiscoveryError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_fetch_and_discover_direct_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/feed.xml", server.uri());
        let feed = fetch_and_discover(&client, &url).await.unwrap();
        assert_eq!(feed.title, "Example Blog");
        assert_eq!(feed.feed_url, url);
    }

    #[tokio::test]
    async fn test_html_page_without_feed_probes_common_paths() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><head></head><body>hi</body></html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&server)
            .await;
        // Every other probe 404s
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let feed = fetch_and_discover(&client, &format!("{}/", server.uri()))
            .await
            .unwrap();
        assert_eq!(feed.title, "Example Blog");
        assert!(feed.feed_url.ends_with("/feed"));
    }

    #[tokio::test]
    async fn test_not_a_feed_anywhere() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>nothing here</body></html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_and_discover(&client, &format!("{}/page", server.uri())).await;
        assert!(matches!(result, Err(DiscoveryError::NotAFeed)));
    }
}
