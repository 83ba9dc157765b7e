//! Process-level configuration from an optional TOML file.
//!
//! Only concerns that must exist before the database opens live here
//! (paths, bind address, update channel); everything user-tunable at
//! runtime is in the settings table. A missing file yields defaults,
//! unknown keys are warned about and ignored.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

/// Top-level configuration. All fields default so any subset of keys can
/// be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub bind_addr: String,

    /// Data directory (database, media cache, scripts). Defaults to the
    /// platform data dir + `trawl`.
    pub data_dir: Option<PathBuf>,

    /// Directory the static UI is served from.
    pub static_dir: PathBuf,

    /// Whether `/api/browser/open` may use the host opener; when false the
    /// endpoint always answers with a redirect payload for the client to
    /// follow itself.
    pub open_in_browser: bool,

    /// GitHub `owner/repo` slug update checks run against.
    pub update_repo: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4170".to_owned(),
            data_dir: None,
            static_dir: PathBuf::from("static"),
            open_in_browser: false,
            update_repo: "trawl-app/trawl".to_owned(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB); a larger file is corrupt or hostile.
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line info
    /// - Unknown keys → accepted, logged as warnings
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "bind_addr",
                "data_dir",
                "static_dir",
                "open_in_browser",
                "update_repo",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), bind = %config.bind_addr, "Loaded configuration");
        Ok(config)
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("trawl")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("trawl.db")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir().join("scripts")
    }

    pub fn media_cache_dir(&self) -> PathBuf {
        self.data_dir().join("media-cache")
    }

    pub fn updates_dir(&self) -> PathBuf {
        std::env::temp_dir().join("trawl-updates")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "127.0.0.1:4170");
        assert!(!config.open_in_browser);
        assert_eq!(config.update_repo, "trawl-app/trawl");
    }

    #[test]
    fn test_missing_file_returns_default() {
        let config = Config::load(Path::new("/tmp/trawl_test_nonexistent.toml")).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:4170");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_addr = \"0.0.0.0:8080\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.update_repo, "trawl-app/trawl");
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:9000\"\nmystery = 1\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::TooLarge(_)
        ));
    }

    #[test]
    fn test_data_dir_override_drives_paths() {
        let config = Config {
            data_dir: Some(PathBuf::from("/var/lib/trawl")),
            ..Default::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/trawl/trawl.db"));
        assert_eq!(config.scripts_dir(), PathBuf::from("/var/lib/trawl/scripts"));
        assert_eq!(
            config.media_cache_dir(),
            PathBuf::from("/var/lib/trawl/media-cache")
        );
    }
}
