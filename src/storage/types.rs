use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Feed model
// ============================================================================

/// How a feed's items are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedKind {
    #[serde(rename = "rss")]
    Rss,
    #[serde(rename = "atom")]
    Atom,
    #[serde(rename = "html+xpath")]
    HtmlXpath,
    #[serde(rename = "xml+xpath")]
    XmlXpath,
    #[serde(rename = "script")]
    Script,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "rsshub")]
    Rsshub,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Rss => "rss",
            FeedKind::Atom => "atom",
            FeedKind::HtmlXpath => "html+xpath",
            FeedKind::XmlXpath => "xml+xpath",
            FeedKind::Script => "script",
            FeedKind::Email => "email",
            FeedKind::Rsshub => "rsshub",
        }
    }

    /// Unknown tags fall back to plain RSS; the column predates the tag set.
    pub fn parse(s: &str) -> Self {
        match s {
            "atom" => FeedKind::Atom,
            "html+xpath" => FeedKind::HtmlXpath,
            "xml+xpath" => FeedKind::XmlXpath,
            "script" => FeedKind::Script,
            "email" => FeedKind::Email,
            "rsshub" => FeedKind::Rsshub,
            _ => FeedKind::Rss,
        }
    }
}

/// Outcome of the most recent fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Failed,
    Unknown,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Success => "success",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => UpdateStatus::Success,
            "failed" => UpdateStatus::Failed,
            _ => UpdateStatus::Unknown,
        }
    }
}

/// The ten selector expressions driving `html+xpath` / `xml+xpath` feeds.
///
/// All optional; a plain RSS feed carries none of them. `time_format` is a
/// chrono format string applied to the text selected by `time`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub categories: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

impl SelectorConfig {
    pub fn is_empty(&self) -> bool {
        *self == SelectorConfig::default()
    }
}

/// A subscription as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub url: String,
    /// `/`-delimited category path; empty string = uncategorised
    pub category: String,
    pub image_url: Option<String>,
    pub kind: FeedKind,
    pub selectors: SelectorConfig,
    pub script_path: Option<String>,
    pub hidden: bool,
    pub image_mode: bool,
    pub proxy_url: Option<String>,
    /// 0 = follow global setting, −1 = adaptive, >0 = minutes
    pub refresh_interval: i64,
    pub last_updated: Option<i64>,
    pub last_error: Option<String>,
    pub last_status: UpdateStatus,
    /// Synchronised from an external source; read-only to user edits
    pub managed: bool,
    pub consecutive_failures: i64,
}

/// Fields a subscribe/update request may carry.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFeed {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: FeedKind,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub image_mode: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub refresh_interval: i64,
    #[serde(default)]
    pub managed: bool,
}

fn default_kind() -> FeedKind {
    FeedKind::Rss
}

/// Internal row type for feed queries (sqlx FromRow), flat columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub category: String,
    pub image_url: Option<String>,
    pub kind: String,
    pub item_xpath: Option<String>,
    pub title_xpath: Option<String>,
    pub content_xpath: Option<String>,
    pub link_xpath: Option<String>,
    pub author_xpath: Option<String>,
    pub time_xpath: Option<String>,
    pub time_format: Option<String>,
    pub thumb_xpath: Option<String>,
    pub category_xpath: Option<String>,
    pub uid_xpath: Option<String>,
    pub script_path: Option<String>,
    pub hidden: bool,
    pub image_mode: bool,
    pub proxy_url: Option<String>,
    pub refresh_interval: i64,
    pub last_updated: Option<i64>,
    pub last_error: Option<String>,
    pub last_status: String,
    pub managed: bool,
    pub consecutive_failures: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: self.title,
            url: self.url,
            category: self.category,
            image_url: self.image_url,
            kind: FeedKind::parse(&self.kind),
            selectors: SelectorConfig {
                item: self.item_xpath,
                title: self.title_xpath,
                content: self.content_xpath,
                link: self.link_xpath,
                author: self.author_xpath,
                time: self.time_xpath,
                time_format: self.time_format,
                thumbnail: self.thumb_xpath,
                categories: self.category_xpath,
                uid: self.uid_xpath,
            },
            script_path: self.script_path,
            hidden: self.hidden,
            image_mode: self.image_mode,
            proxy_url: self.proxy_url,
            refresh_interval: self.refresh_interval,
            last_updated: self.last_updated,
            last_error: self.last_error,
            last_status: UpdateStatus::parse(&self.last_status),
            managed: self.managed,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

// ============================================================================
// Article model
// ============================================================================

/// A stored article, joined with its feed's title for list views.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub feed_title: String,
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    /// Unix seconds, always set (insertion time when the feed omits it)
    pub published: i64,
    pub read: bool,
    pub favorite: bool,
    pub read_later: bool,
    pub hidden: bool,
    pub translated_title: Option<String>,
}

/// A normalised feed item as emitted by the parser, before persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArticle {
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    /// Unix seconds UTC; the parser fills insertion time when missing
    pub published: i64,
    /// HTML body from the feed itself, stored as the initial content cache
    pub content: Option<String>,
    /// Explicit identity from a selector-configured feed's `uid` expression;
    /// plain RSS/Atom items leave this unset
    pub uid: Option<String>,
}

impl ParsedArticle {
    /// Natural dedup key: an explicit uid when the feed's selectors provide
    /// one, else the URL, else a digest of title and timestamp so URL-less
    /// items still deduplicate.
    pub fn dedup_key(&self) -> String {
        if let Some(uid) = self.uid.as_deref().filter(|u| !u.is_empty()) {
            return uid.to_owned();
        }
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => {
                let digest =
                    Sha256::digest(format!("{}|{}", self.title, self.published).as_bytes());
                format!("{:x}", digest)
            }
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Article list filter, as received from the API's `filter` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArticleFilter {
    #[default]
    All,
    Unread,
    Favorites,
    ReadLater,
    ImageGallery,
}

impl ArticleFilter {
    /// Empty string means "all"; unknown values are rejected by the caller.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "all" => Some(ArticleFilter::All),
            "unread" => Some(ArticleFilter::Unread),
            "favorites" | "favourites" => Some(ArticleFilter::Favorites),
            "readLater" | "read_later" => Some(ArticleFilter::ReadLater),
            "imageGallery" | "image_gallery" => Some(ArticleFilter::ImageGallery),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_kind_roundtrip() {
        for kind in [
            FeedKind::Rss,
            FeedKind::Atom,
            FeedKind::HtmlXpath,
            FeedKind::XmlXpath,
            FeedKind::Script,
            FeedKind::Email,
            FeedKind::Rsshub,
        ] {
            assert_eq!(FeedKind::parse(kind.as_str()), kind);
        }
        assert_eq!(FeedKind::parse("bogus"), FeedKind::Rss);
    }

    #[test]
    fn test_dedup_key_prefers_url() {
        let a = ParsedArticle {
            title: "T".into(),
            url: Some("https://example.com/a".into()),
            image_url: None,
            audio_url: None,
            published: 100,
            content: None,
            uid: None,
        };
        assert_eq!(a.dedup_key(), "https://example.com/a");
    }

    #[test]
    fn test_dedup_key_urlless_stable() {
        let a = ParsedArticle {
            title: "T".into(),
            url: None,
            image_url: None,
            audio_url: None,
            published: 100,
            content: None,
            uid: None,
        };
        let b = a.clone();
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key().len(), 64, "sha256 hex digest");
    }

    #[test]
    fn test_dedup_key_urlless_differs_by_time() {
        let a = ParsedArticle {
            title: "T".into(),
            url: None,
            image_url: None,
            audio_url: None,
            published: 100,
            content: None,
            uid: None,
        };
        let mut b = a.clone();
        b.published = 101;
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(ArticleFilter::parse(""), Some(ArticleFilter::All));
        assert_eq!(ArticleFilter::parse("unread"), Some(ArticleFilter::Unread));
        assert_eq!(
            ArticleFilter::parse("favourites"),
            Some(ArticleFilter::Favorites)
        );
        assert_eq!(
            ArticleFilter::parse("readLater"),
            Some(ArticleFilter::ReadLater)
        );
        assert_eq!(ArticleFilter::parse("nope"), None);
    }
}
