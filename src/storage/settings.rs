use anyhow::Result;
use std::collections::BTreeMap;

use super::schema::Database;
use crate::vault::Vault;

/// The enumerated settings keys.
///
/// Everything runtime-tunable lives in the settings table; the TOML config
/// only covers process-level concerns (paths, bind address). Keys flagged
/// encrypted never store plaintext — [`Database::set_setting`] routes them
/// through the vault and readers decrypt on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SettingKey {
    UpdateInterval,
    TranslationEnabled,
    TargetLanguage,
    TranslationProvider,
    DeeplApiKey,
    BaiduAppId,
    BaiduApiKey,
    AiApiKey,
    AiEndpoint,
    AiModel,
    AiSystemPrompt,
    SummaryEnabled,
    SummaryLength,
    SummaryProvider,
    AiSummaryApiKey,
    AiSummaryEndpoint,
    AiSummaryModel,
    AutoCleanupEnabled,
    MaxCacheSizeMb,
    MaxArticleAgeDays,
    ShowHiddenArticles,
    DefaultViewMode,
    MediaCacheEnabled,
    FullTextFetchEnabled,
    ImageGalleryEnabled,
    Shortcuts,
    Rules,
    Theme,
    Language,
    LastArticleUpdate,
}

impl SettingKey {
    pub const ALL: &'static [SettingKey] = &[
        SettingKey::UpdateInterval,
        SettingKey::TranslationEnabled,
        SettingKey::TargetLanguage,
        SettingKey::TranslationProvider,
        SettingKey::DeeplApiKey,
        SettingKey::BaiduAppId,
        SettingKey::BaiduApiKey,
        SettingKey::AiApiKey,
        SettingKey::AiEndpoint,
        SettingKey::AiModel,
        SettingKey::AiSystemPrompt,
        SettingKey::SummaryEnabled,
        SettingKey::SummaryLength,
        SettingKey::SummaryProvider,
        SettingKey::AiSummaryApiKey,
        SettingKey::AiSummaryEndpoint,
        SettingKey::AiSummaryModel,
        SettingKey::AutoCleanupEnabled,
        SettingKey::MaxCacheSizeMb,
        SettingKey::MaxArticleAgeDays,
        SettingKey::ShowHiddenArticles,
        SettingKey::DefaultViewMode,
        SettingKey::MediaCacheEnabled,
        SettingKey::FullTextFetchEnabled,
        SettingKey::ImageGalleryEnabled,
        SettingKey::Shortcuts,
        SettingKey::Rules,
        SettingKey::Theme,
        SettingKey::Language,
        SettingKey::LastArticleUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::UpdateInterval => "update_interval",
            SettingKey::TranslationEnabled => "translation_enabled",
            SettingKey::TargetLanguage => "target_language",
            SettingKey::TranslationProvider => "translation_provider",
            SettingKey::DeeplApiKey => "deepl_api_key",
            SettingKey::BaiduAppId => "baidu_app_id",
            SettingKey::BaiduApiKey => "baidu_api_key",
            SettingKey::AiApiKey => "ai_api_key",
            SettingKey::AiEndpoint => "ai_endpoint",
            SettingKey::AiModel => "ai_model",
            SettingKey::AiSystemPrompt => "ai_system_prompt",
            SettingKey::SummaryEnabled => "summary_enabled",
            SettingKey::SummaryLength => "summary_length",
            SettingKey::SummaryProvider => "summary_provider",
            SettingKey::AiSummaryApiKey => "ai_summary_api_key",
            SettingKey::AiSummaryEndpoint => "ai_summary_endpoint",
            SettingKey::AiSummaryModel => "ai_summary_model",
            SettingKey::AutoCleanupEnabled => "auto_cleanup_enabled",
            SettingKey::MaxCacheSizeMb => "max_cache_size_mb",
            SettingKey::MaxArticleAgeDays => "max_article_age_days",
            SettingKey::ShowHiddenArticles => "show_hidden_articles",
            SettingKey::DefaultViewMode => "default_view_mode",
            SettingKey::MediaCacheEnabled => "media_cache_enabled",
            SettingKey::FullTextFetchEnabled => "full_text_fetch_enabled",
            SettingKey::ImageGalleryEnabled => "image_gallery_enabled",
            SettingKey::Shortcuts => "shortcuts",
            SettingKey::Rules => "rules",
            SettingKey::Theme => "theme",
            SettingKey::Language => "language",
            SettingKey::LastArticleUpdate => "last_article_update",
        }
    }

    pub fn from_str(s: &str) -> Option<SettingKey> {
        SettingKey::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Keys whose values are credentials, stored as vault ciphertext only.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            SettingKey::DeeplApiKey
                | SettingKey::BaiduApiKey
                | SettingKey::AiApiKey
                | SettingKey::AiSummaryApiKey
        )
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            SettingKey::UpdateInterval => "30",
            SettingKey::TargetLanguage => "en",
            SettingKey::TranslationProvider => "google",
            SettingKey::SummaryLength => "medium",
            SettingKey::SummaryProvider => "local",
            SettingKey::MaxCacheSizeMb => "500",
            SettingKey::MaxArticleAgeDays => "30",
            SettingKey::DefaultViewMode => "rendered",
            SettingKey::Shortcuts => "{}",
            SettingKey::Rules => "[]",
            SettingKey::Theme => "light",
            SettingKey::Language => "en",
            SettingKey::TranslationEnabled
            | SettingKey::SummaryEnabled
            | SettingKey::AutoCleanupEnabled
            | SettingKey::ShowHiddenArticles
            | SettingKey::MediaCacheEnabled
            | SettingKey::FullTextFetchEnabled
            | SettingKey::ImageGalleryEnabled => "false",
            _ => "",
        }
    }
}

impl Database {
    // ========================================================================
    // Settings
    // ========================================================================

    /// Read a setting, falling back to its default when unset.
    ///
    /// Encrypted keys come back as plaintext: the stored ciphertext goes
    /// through the vault on the way out.
    pub async fn get_setting(&self, key: SettingKey) -> Result<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let raw = match row {
            Some((value,)) => value,
            None => return Ok(key.default_value().to_owned()),
        };

        if key.is_encrypted() && !raw.is_empty() {
            return self
                .vault
                .decrypt(&raw)
                .map_err(|e| anyhow::anyhow!("setting {}: {e}", key.as_str()));
        }

        Ok(raw)
    }

    /// Upsert a setting. Encrypted keys are sealed before they hit disk, so
    /// the table never holds their plaintext.
    pub async fn set_setting(&self, key: SettingKey, value: &str) -> Result<()> {
        let stored = if key.is_encrypted() && !value.is_empty() {
            self.vault
                .encrypt(value)
                .map_err(|e| anyhow::anyhow!("setting {}: {e}", key.as_str()))?
        } else {
            value.to_owned()
        };

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key.as_str())
        .bind(stored)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The raw stored string for an encrypted key (base64 blob), bypassing
    /// decryption. Exists for tests and diagnostics.
    pub async fn get_setting_raw(&self, key: SettingKey) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// All enumerated settings with defaults applied and credentials
    /// decrypted, as served by `GET /api/settings`.
    pub async fn get_all_settings(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for key in SettingKey::ALL {
            out.insert(key.as_str().to_owned(), self.get_setting(*key).await?);
        }
        Ok(out)
    }

    /// Convenience readers for the handful of typed settings the scheduler
    /// and enrichment paths poll.
    pub async fn setting_bool(&self, key: SettingKey) -> Result<bool> {
        Ok(self.get_setting(key).await?.trim() == "true")
    }

    pub async fn setting_i64(&self, key: SettingKey) -> Result<i64> {
        let raw = self.get_setting(key).await?;
        Ok(raw
            .trim()
            .parse()
            .unwrap_or_else(|_| key.default_value().parse().unwrap_or(0)))
    }
}

/// Re-exported so callers can check blob shape without a database handle.
pub fn is_encrypted_blob(s: &str) -> bool {
    Vault::is_encrypted(s)
}
