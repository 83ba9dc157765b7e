//! Script-backed feeds.
//!
//! A feed of kind `script` names an executable inside the configured
//! scripts directory; its stdout must be an RSS or Atom document, which
//! then goes through the normal normalisation path. The name must be a
//! bare file name — path separators and `..` are rejected so a feed row
//! can never point outside the directory. Beyond that the scripts run with
//! the service's own privileges; trusting their contents is the operator's
//! call.

use std::path::Path;
use std::time::Duration;

use crate::storage::Feed;

use super::parser::{parse_feed_bytes, FetchedFeed, ParseError};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on captured stdout, same bound as a fetched feed body
const MAX_SCRIPT_OUTPUT: usize = 10 * 1024 * 1024;

pub async fn run_script_feed(feed: &Feed, scripts_dir: &Path) -> Result<FetchedFeed, ParseError> {
    let name = feed
        .script_path
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ParseError::Script("no script configured".to_owned()))?;

    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ParseError::Script(format!(
            "script name must be a bare file name, got `{name}`"
        )));
    }

    let path = scripts_dir.join(name);
    if !path.is_file() {
        return Err(ParseError::Script(format!(
            "script not found: {}",
            path.display()
        )));
    }

    let output = tokio::time::timeout(
        SCRIPT_TIMEOUT,
        tokio::process::Command::new(&path)
            .env("TRAWL_FEED_URL", &feed.url)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ParseError::Timeout)?
    .map_err(|e| ParseError::Script(format!("failed to run {}: {e}", path.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let snippet: String = stderr.chars().take(200).collect();
        return Err(ParseError::Script(format!(
            "script exited with {}: {}",
            output.status, snippet
        )));
    }

    if output.stdout.len() > MAX_SCRIPT_OUTPUT {
        return Err(ParseError::TooLarge);
    }

    parse_feed_bytes(&output.stdout, &feed.url)
}
