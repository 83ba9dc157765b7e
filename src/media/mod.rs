//! Media proxying: `<img>` URL rewriting in stored HTML and the on-disk
//! response cache behind the proxy endpoint.
//!
//! Rewriting defeats cheap hotlink protection: every remote image URL is
//! URL-safe-base64ed into `{proxy}?url_b64=…&referer_b64=…`, and the proxy
//! fetches it with the owning feed's URL as the Referer. Lazy-loading
//! markup (`data-original` / `data-src`) is unwrapped first so the real
//! URL is the one rewritten. Data URLs, blob URLs and local/relative
//! sources stay untouched.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Largest response body the proxy will cache
pub const MAX_CACHEABLE_BYTES: usize = 10 * 1024 * 1024;

/// Attributes that lazy-loading scripts park the real URL in
const LAZY_SRC_ATTRS: &[&str] = &["data-original", "data-src"];

// ============================================================================
// URL encoding
// ============================================================================

/// URL-safe base64 without padding — survives query strings containing
/// `&`, `?`, pre-encoded fragments and non-ASCII bytes without a second
/// encoding layer.
pub fn encode_url_b64(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Decode tolerant of `=` padding, since clients may normalise.
pub fn decode_url_b64(encoded: &str) -> Option<String> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD.decode(trimmed).ok()?;
    String::from_utf8(bytes).ok()
}

// ============================================================================
// HTML rewriting
// ============================================================================

/// Rewrite every remote `<img src>` in `html` to go through the proxy.
///
/// `referer` is the owning feed's URL; the proxy replays it on fetch.
pub fn rewrite_html(html: &str, referer: &str, proxy_path: &str) -> String {
    let mut out = String::with_capacity(html.len() + html.len() / 4);
    // ASCII folding keeps byte offsets aligned with the original string
    let lower = html.to_ascii_lowercase();
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find("<img") {
        let start = pos + rel;
        // Guard against matching "<imgx...": next char must end the name
        let after = lower.as_bytes().get(start + 4).copied();
        let name_ok = matches!(after, Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'>') | Some(b'/'));
        let Some(end_rel) = lower[start..].find('>') else {
            break;
        };
        let end = start + end_rel;

        out.push_str(&html[pos..start]);
        if name_ok {
            out.push_str(&rewrite_img_tag(&html[start..=end], referer, proxy_path));
        } else {
            out.push_str(&html[start..=end]);
        }
        pos = end + 1;
    }
    out.push_str(&html[pos..]);
    out
}

fn rewrite_img_tag(tag: &str, referer: &str, proxy_path: &str) -> String {
    let self_closing = tag.trim_end_matches('>').trim_end().ends_with('/');
    let inner = tag
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_end_matches('/')
        .trim();
    // Strip the tag name, whatever case the document used
    let attrs_text = if inner.len() >= 3 && inner[..3].eq_ignore_ascii_case("img") {
        &inner[3..]
    } else {
        inner
    };

    let mut attrs = parse_attrs(attrs_text);

    // Lazy unwrap: promote the parked URL to src, drop the park attribute
    // and the `lazy` class token
    let lazy_src = LAZY_SRC_ATTRS.iter().find_map(|name| {
        attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.clone())
    });
    if let Some(lazy_src) = lazy_src {
        attrs.retain(|(k, _)| !LAZY_SRC_ATTRS.iter().any(|name| k.eq_ignore_ascii_case(name)));
        set_attr(&mut attrs, "src", &lazy_src);
        strip_class_token(&mut attrs, "lazy");
    }

    if let Some(src) = get_attr(&attrs, "src") {
        if should_proxy(&src, proxy_path) {
            let rewritten = format!(
                "{proxy_path}?url_b64={}&referer_b64={}",
                encode_url_b64(&src),
                encode_url_b64(referer)
            );
            set_attr(&mut attrs, "src", &rewritten);
        }
    }

    let mut rebuilt = String::from("<img");
    for (name, value) in &attrs {
        rebuilt.push(' ');
        rebuilt.push_str(name);
        if let Some(value) = value {
            rebuilt.push_str("=\"");
            rebuilt.push_str(&value.replace('"', "&quot;"));
            rebuilt.push('"');
        }
    }
    if self_closing {
        rebuilt.push_str(" /");
    }
    rebuilt.push('>');
    rebuilt
}

/// Only absolute http(s) URLs that are not already ours get proxied;
/// data:, blob: and local/relative sources stay as written.
fn should_proxy(src: &str, proxy_path: &str) -> bool {
    let lower = src.to_lowercase();
    if lower.starts_with("data:") || lower.starts_with("blob:") {
        return false;
    }
    if src.starts_with(proxy_path) {
        return false;
    }
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn get_attr(attrs: &[(String, Option<String>)], name: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.clone())
}

fn set_attr(attrs: &mut Vec<(String, Option<String>)>, name: &str, value: &str) {
    if let Some(entry) = attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = Some(value.to_owned());
    } else {
        attrs.push((name.to_owned(), Some(value.to_owned())));
    }
}

fn strip_class_token(attrs: &mut [(String, Option<String>)], token: &str) {
    if let Some(entry) = attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("class")) {
        if let Some(classes) = &entry.1 {
            let kept: Vec<&str> = classes
                .split_whitespace()
                .filter(|c| !c.eq_ignore_ascii_case(token))
                .collect();
            entry.1 = Some(kept.join(" "));
        }
    }
}

/// Minimal attribute scanner for one tag: `name`, `name=value`,
/// `name="value"`, `name='value'`.
fn parse_attrs(text: &str) -> Vec<(String, Option<String>)> {
    let mut attrs = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };
        if first == '>' || first == '/' {
            break;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '=' || c == '>' || c == '/' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            chars.next();
            continue;
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            let mut value = String::new();
            match chars.peek() {
                Some(&q) if q == '"' || q == '\'' => {
                    chars.next();
                    for c in chars.by_ref() {
                        if c == q {
                            break;
                        }
                        value.push(c);
                    }
                }
                _ => {
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() || c == '>' {
                            break;
                        }
                        value.push(c);
                        chars.next();
                    }
                }
            }
            attrs.push((name, Some(value)));
        } else {
            attrs.push((name, None));
        }
    }

    attrs
}

// ============================================================================
// Disk cache
// ============================================================================

/// Content-addressed response cache for the proxy.
///
/// Bytes live in `<sha256(url)>`, the content type in a `.meta` sidecar.
/// The sidecar is rewritten on every hit, so its mtime is the last-access
/// time and eviction by oldest sidecar is LRU.
pub struct MediaCache {
    dir: PathBuf,
}

impl MediaCache {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let name = hex::encode(Sha256::digest(url.as_bytes()));
        (self.dir.join(&name), self.dir.join(format!("{name}.meta")))
    }

    /// Cached bytes and content type, bumping last-access.
    pub fn get(&self, url: &str) -> Option<(Vec<u8>, String)> {
        let (data_path, meta_path) = self.paths(url);
        let bytes = std::fs::read(&data_path).ok()?;
        let content_type = std::fs::read_to_string(&meta_path).ok()?;
        // Rewriting the sidecar refreshes its mtime (the LRU clock)
        let _ = std::fs::write(&meta_path, &content_type);
        Some((bytes, content_type))
    }

    /// Store a response, then evict the least-recently-used entries until
    /// the cache fits `max_size_mb`.
    pub fn put(
        &self,
        url: &str,
        content_type: &str,
        bytes: &[u8],
        max_size_mb: u64,
    ) -> std::io::Result<()> {
        if bytes.len() > MAX_CACHEABLE_BYTES {
            return Ok(());
        }
        let (data_path, meta_path) = self.paths(url);
        std::fs::write(&data_path, bytes)?;
        std::fs::write(&meta_path, content_type)?;
        self.evict_to_limit(max_size_mb.saturating_mul(1024 * 1024))?;
        Ok(())
    }

    pub fn clear(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    fn evict_to_limit(&self, max_bytes: u64) -> std::io::Result<()> {
        // Collect (meta mtime, data path, meta path, data size)
        let mut entries = Vec::new();
        let mut total: u64 = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "meta") {
                continue;
            }
            let meta_path = path.with_extension("meta");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let accessed = std::fs::metadata(&meta_path)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            total = total.saturating_add(size);
            entries.push((accessed, path, meta_path, size));
        }

        if total <= max_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(accessed, ..)| *accessed);
        for (_, data_path, meta_path, size) in entries {
            if total <= max_bytes {
                break;
            }
            if std::fs::remove_file(&data_path).is_ok() {
                let _ = std::fs::remove_file(&meta_path);
                total = total.saturating_sub(size);
                tracing::debug!(path = %data_path.display(), "evicted media cache entry");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY: &str = "/api/media";

    #[test]
    fn test_b64_roundtrip_hostile_urls() {
        for url in [
            "https://cdn.x/a.png",
            "https://cdn.x/a.png?w=100&h=200",
            "https://cdn.x/搜索.png",
            "https://cdn.x/a%20b.png?q=r&s=t#frag",
        ] {
            assert_eq!(decode_url_b64(&encode_url_b64(url)).as_deref(), Some(url));
        }
    }

    #[test]
    fn test_b64_decode_tolerates_padding() {
        let encoded = format!("{}==", encode_url_b64("https://cdn.x/a.png"));
        assert_eq!(decode_url_b64(&encoded).as_deref(), Some("https://cdn.x/a.png"));
    }

    #[test]
    fn test_rewrite_remote_img() {
        let html = r#"<p>pic: <img src="http://cdn.x/a.png" alt="a"></p>"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);

        assert!(!out.contains("http://cdn.x/a.png"));
        assert!(out.contains("url_b64="));
        let encoded = encode_url_b64("http://cdn.x/a.png");
        assert!(out.contains(&encoded));
        let referer = encode_url_b64("https://blog.y/");
        assert!(out.contains(&format!("referer_b64={referer}")));
        assert!(out.contains(r#"alt="a""#), "other attributes survive");
    }

    #[test]
    fn test_rewrite_referer_decodes_back() {
        let html = r#"<img src="http://cdn.x/a.png">"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);
        let referer_b64 = out
            .split("referer_b64=")
            .nth(1)
            .unwrap()
            .trim_end_matches(|c| c == '"' || c == '>');
        assert_eq!(decode_url_b64(referer_b64).as_deref(), Some("https://blog.y/"));
    }

    #[test]
    fn test_data_and_blob_urls_untouched() {
        let html = r#"<img src="data:image/png;base64,AAAA"><img src="blob:xyz">"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);
        assert!(out.contains("data:image/png;base64,AAAA"));
        assert!(out.contains("blob:xyz"));
        assert!(!out.contains("url_b64="));
    }

    #[test]
    fn test_relative_and_proxied_urls_untouched() {
        let html = format!(r#"<img src="/local/a.png"><img src="{PROXY}?url_b64=abc">"#);
        let out = rewrite_html(&html, "https://blog.y/", PROXY);
        assert!(out.contains(r#"src="/local/a.png""#));
        assert_eq!(out.matches("url_b64=").count(), 1, "already-proxied src stays");
    }

    #[test]
    fn test_lazy_image_unwrap() {
        let html = r#"<img class="lazy photo" data-original="https://cdn.x/real.jpg" src="https://cdn.x/placeholder.gif">"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);

        assert!(!out.contains("data-original"));
        assert!(!out.contains("placeholder.gif"));
        let encoded = encode_url_b64("https://cdn.x/real.jpg");
        assert!(out.contains(&encoded), "real URL is the one proxied");
        assert!(out.contains(r#"class="photo""#), "lazy token removed, others kept");
    }

    #[test]
    fn test_data_src_variant() {
        let html = r#"<img data-src="https://cdn.x/real.jpg" class="lazy">"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);
        assert!(!out.contains("data-src"));
        assert!(out.contains(&encode_url_b64("https://cdn.x/real.jpg")));
    }

    #[test]
    fn test_multiple_imgs_and_text_preserved() {
        let html = r#"<h1>T</h1><img src="https://a.x/1.png"><p>mid</p><img src="https://a.x/2.png"><i>end</i>"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);
        assert_eq!(out.matches("url_b64=").count(), 2);
        assert!(out.contains("<h1>T</h1>"));
        assert!(out.contains("<p>mid</p>"));
        assert!(out.contains("<i>end</i>"));
    }

    #[test]
    fn test_self_closing_img_preserved() {
        let html = r#"<img src="https://a.x/1.png" />"#;
        let out = rewrite_html(html, "https://blog.y/", PROXY);
        assert!(out.trim_end().ends_with("/>"));
    }

    #[test]
    fn test_media_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf()).unwrap();

        assert!(cache.get("https://cdn.x/a.png").is_none());
        cache
            .put("https://cdn.x/a.png", "image/png", b"PNGDATA", 10)
            .unwrap();

        let (bytes, content_type) = cache.get("https://cdn.x/a.png").unwrap();
        assert_eq!(bytes, b"PNGDATA");
        assert_eq!(content_type, "image/png");
    }

    #[test]
    fn test_media_cache_eviction_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf()).unwrap();

        // ~0.5 MB per entry against a 1 MB cap: the third insert evicts
        let blob = vec![0u8; 512 * 1024];
        cache.put("https://cdn.x/1.png", "image/png", &blob, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.put("https://cdn.x/2.png", "image/png", &blob, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.put("https://cdn.x/3.png", "image/png", &blob, 1).unwrap();

        let survivors = [
            cache.get("https://cdn.x/1.png").is_some(),
            cache.get("https://cdn.x/2.png").is_some(),
            cache.get("https://cdn.x/3.png").is_some(),
        ];
        assert!(
            survivors.iter().filter(|s| **s).count() <= 2,
            "cache must stay under the cap"
        );
        assert!(survivors[2], "the newest entry survives");
        assert!(!survivors[0], "the oldest entry goes first");
    }

    #[test]
    fn test_media_cache_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf()).unwrap();
        cache.put("https://cdn.x/a.png", "image/png", b"X", 10).unwrap();
        cache.clear().unwrap();
        assert!(cache.get("https://cdn.x/a.png").is_none());
    }
}
