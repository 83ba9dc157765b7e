use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Validation failures for user- or feed-supplied URLs.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("private address not allowed: {0}")]
    PrivateIp(String),
    #[error("localhost not allowed")]
    Localhost,
}

/// Validates a URL before the service will fetch it.
///
/// Subscribe targets, discovery seeds and proxied image URLs all come from
/// outside; fetching them blindly would let a crafted URL reach the local
/// network (SSRF). Rejected: non-http(s) schemes, localhost, and private or
/// link-local addresses (including IPv4-mapped IPv6 notation).
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Localhost);
        }

        // Bracketed IPv6 hosts parse with the brackets attached
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

/// Validates a URL before handing it to the host's opener.
///
/// `open::that()` shells through `xdg-open` on Linux, so beyond the SSRF
/// checks the string must not be able to smuggle shell syntax: control
/// characters, Unicode line separators, encoded CR/LF and the more dangerous
/// metacharacters are all rejected. `&`, `?`, `=`, `#` stay allowed since
/// they are ordinary query-string characters.
pub fn validate_url_for_open(url_str: &str) -> Result<(), &'static str> {
    if url_str.bytes().any(|b| b < 32 || b == 127) {
        return Err("URL contains control characters");
    }

    if url_str.chars().any(|c| c == '\u{2028}' || c == '\u{2029}') {
        return Err("URL contains line separator characters");
    }

    let lowered = url_str.to_ascii_lowercase();
    if lowered.contains("%0a") || lowered.contains("%0d") {
        return Err("URL contains encoded control characters");
    }

    if !url_str.starts_with("http://") && !url_str.starts_with("https://") {
        return Err("URL must use http or https scheme");
    }

    const DANGEROUS_CHARS: &[char] = &['`', '$', ';', '|', '<', '>', '(', ')', '{', '}', '\\'];
    if url_str.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
        return Err("URL contains unsafe characters");
    }

    validate_url(url_str).map_err(|e| match e {
        UrlValidationError::InvalidUrl(_) => "invalid URL format",
        UrlValidationError::Localhost | UrlValidationError::PrivateIp(_) => {
            "URL points to a restricted address"
        }
        UrlValidationError::UnsupportedScheme(_) => "URL must use http or https scheme",
    })?;

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            // ::ffff:10.0.0.1 and friends must not bypass the IPv4 rules
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            unique_local || link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls_accepted() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://news.example.org").is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn test_localhost_and_loopback_rejected() {
        assert!(validate_url("http://localhost/feed").is_err());
        assert!(validate_url("http://127.0.0.1/feed").is_err());
        assert!(validate_url("http://[::1]/feed").is_err());
    }

    #[test]
    fn test_private_ranges_rejected() {
        assert!(validate_url("http://192.168.1.1/feed").is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed").is_err());
        assert!(validate_url("http://172.16.0.1/feed").is_err());
        assert!(validate_url("http://169.254.1.1/feed").is_err());
        assert!(validate_url("http://[fe80::1]/feed").is_err());
        assert!(validate_url("http://0.0.0.0/feed").is_err());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_rejected() {
        assert!(validate_url("http://[::ffff:192.168.0.1]/feed").is_err());
    }

    #[test]
    fn test_open_rejects_shell_metacharacters() {
        assert!(validate_url_for_open("https://example.com/a;rm -rf /").is_err());
        assert!(validate_url_for_open("https://example.com/$(whoami)").is_err());
        assert!(validate_url_for_open("https://example.com/a%0Aecho").is_err());
    }

    #[test]
    fn test_open_allows_query_strings() {
        assert!(validate_url_for_open("https://example.com/a?x=1&y=2#frag").is_ok());
    }
}
