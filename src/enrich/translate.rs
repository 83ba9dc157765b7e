use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{Database, SettingKey};

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Baidu's endpoint is slow to fail; a tighter deadline keeps batches moving
const BAIDU_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EnrichError {
    /// Provider needs credentials that are not configured
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),
    /// AI endpoints must be https; anything else fails closed
    #[error("endpoint must use https: {0}")]
    InsecureEndpoint(String),
    /// Unrecognised provider name in settings
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("request timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Upstream(String),
    #[error("unexpected provider response: {0}")]
    Decode(String),
    #[error("{0}")]
    Internal(String),
}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        EnrichError::Upstream(err.to_string())
    }
}

/// A translation back-end. Implementations must be cheap to call with
/// empty input — the cache wrapper short-circuits that case before the
/// trait is ever reached.
#[async_trait]
pub trait Translator: Send + Sync + std::fmt::Debug {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError>;
}

// ============================================================================
// Providers
// ============================================================================

/// Deterministic translator for tests and offline use:
/// `"[ES] original title"`.
#[derive(Debug)]
pub struct MockTranslator;

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError> {
        Ok(format!("[{}] {}", target_lang.to_uppercase(), text))
    }
}

/// Keyless Google endpoint (the one the web widget uses).
#[derive(Debug)]
pub struct GoogleFreeTranslator {
    client: reqwest::Client,
}

#[async_trait]
impl Translator for GoogleFreeTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError> {
        let response = tokio::time::timeout(
            TRANSLATE_TIMEOUT,
            self.client
                .get("https://translate.googleapis.com/translate_a/single")
                .query(&[
                    ("client", "gtx"),
                    ("sl", "auto"),
                    ("tl", target_lang),
                    ("dt", "t"),
                    ("q", text),
                ])
                .send(),
        )
        .await
        .map_err(|_| EnrichError::Timeout)??;

        if !response.status().is_success() {
            return Err(EnrichError::Upstream(format!(
                "google returned {}",
                response.status()
            )));
        }

        // Response shape: [[["translated","original",...],...],...]
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Decode(e.to_string()))?;
        let segments = value
            .get(0)
            .and_then(|v| v.as_array())
            .ok_or_else(|| EnrichError::Decode("missing segment array".to_owned()))?;

        let translated: String = segments
            .iter()
            .filter_map(|seg| seg.get(0).and_then(|s| s.as_str()))
            .collect();

        Ok(translated)
    }
}

#[derive(Debug)]
pub struct DeeplTranslator {
    client: reqwest::Client,
    api_key: SecretString,
}

#[async_trait]
impl Translator for DeeplTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError> {
        let body = serde_json::json!({
            "text": [text],
            "target_lang": target_lang.to_uppercase(),
        });

        let response = tokio::time::timeout(
            TRANSLATE_TIMEOUT,
            self.client
                .post("https://api-free.deepl.com/v2/translate")
                .header(
                    "Authorization",
                    format!("DeepL-Auth-Key {}", self.api_key.expose_secret()),
                )
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| EnrichError::Timeout)??;

        if !response.status().is_success() {
            return Err(EnrichError::Upstream(format!(
                "deepl returned {}",
                response.status()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Decode(e.to_string()))?;
        value
            .pointer("/translations/0/text")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or_else(|| EnrichError::Decode("missing translations[0].text".to_owned()))
    }
}

#[derive(Debug)]
pub struct BaiduTranslator {
    client: reqwest::Client,
    app_id: String,
    api_key: SecretString,
}

#[async_trait]
impl Translator for BaiduTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError> {
        // The provider mandates sign = md5(appid + q + salt + key); this is
        // request signing per their API contract, not a security measure.
        let salt = format!("{}", chrono::Utc::now().timestamp_millis());
        let sign_input = format!(
            "{}{}{}{}",
            self.app_id,
            text,
            salt,
            self.api_key.expose_secret()
        );
        let sign = format!("{:x}", md5::compute(sign_input.as_bytes()));

        let response = tokio::time::timeout(
            BAIDU_TIMEOUT,
            self.client
                .get("https://fanyi-api.baidu.com/api/trans/vip/translate")
                .query(&[
                    ("q", text),
                    ("from", "auto"),
                    ("to", target_lang),
                    ("appid", &self.app_id),
                    ("salt", &salt),
                    ("sign", &sign),
                ])
                .send(),
        )
        .await
        .map_err(|_| EnrichError::Timeout)??;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Decode(e.to_string()))?;

        if let Some(code) = value.get("error_code").and_then(|c| c.as_str()) {
            return Err(EnrichError::Upstream(format!("baidu error {code}")));
        }

        value
            .pointer("/trans_result/0/dst")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or_else(|| EnrichError::Decode("missing trans_result[0].dst".to_owned()))
    }
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug)]
pub struct AiTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
    system_prompt: String,
}

const DEFAULT_TRANSLATE_PROMPT: &str = "You are a translation engine. Translate the user's text \
     and reply with the translation only, no commentary.";

#[async_trait]
impl Translator for AiTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EnrichError> {
        let system = if self.system_prompt.is_empty() {
            DEFAULT_TRANSLATE_PROMPT.to_owned()
        } else {
            self.system_prompt.clone()
        };

        let content = chat_completion(
            &self.client,
            &self.endpoint,
            &self.api_key,
            &self.model,
            &system,
            &format!("Translate into {target_lang}:\n\n{text}"),
        )
        .await?;

        Ok(content.trim().to_owned())
    }
}

/// Shared chat-completions call used by the AI translator and summariser.
pub(crate) async fn chat_completion(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &SecretString,
    model: &str,
    system: &str,
    user: &str,
) -> Result<String, EnrichError> {
    let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));

    let body = serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
    });

    let response = tokio::time::timeout(
        TRANSLATE_TIMEOUT,
        client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", api_key.expose_secret()),
            )
            .json(&body)
            .send(),
    )
    .await
    .map_err(|_| EnrichError::Timeout)??;

    if !response.status().is_success() {
        return Err(EnrichError::Upstream(format!(
            "chat endpoint returned {}",
            response.status()
        )));
    }

    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| EnrichError::Decode(e.to_string()))?;
    value
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_owned)
        .ok_or_else(|| EnrichError::Decode("missing choices[0].message.content".to_owned()))
}

// ============================================================================
// Selection & caching
// ============================================================================

/// The settings tuple a translator instance is built from. Any change in
/// it invalidates the cached instance.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TranslatorConfig {
    pub provider: String,
    pub api_key: String,
    pub app_id: String,
    pub endpoint: String,
    pub model: String,
    pub system_prompt: String,
}

/// Credentials stay out of logs and debug output.
impl std::fmt::Debug for TranslatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorConfig")
            .field("provider", &self.provider)
            .field(
                "api_key",
                &if self.api_key.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("app_id", &self.app_id)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl TranslatorConfig {
    /// Resolve the active tuple from settings (credentials decrypted).
    pub async fn load(db: &Database) -> anyhow::Result<Self> {
        let provider = db.get_setting(SettingKey::TranslationProvider).await?;
        let (api_key, app_id) = match provider.as_str() {
            "deepl" => (db.get_setting(SettingKey::DeeplApiKey).await?, String::new()),
            "baidu" => (
                db.get_setting(SettingKey::BaiduApiKey).await?,
                db.get_setting(SettingKey::BaiduAppId).await?,
            ),
            "ai" => (db.get_setting(SettingKey::AiApiKey).await?, String::new()),
            _ => (String::new(), String::new()),
        };

        Ok(TranslatorConfig {
            provider,
            api_key,
            app_id,
            endpoint: db.get_setting(SettingKey::AiEndpoint).await?,
            model: db.get_setting(SettingKey::AiModel).await?,
            system_prompt: db.get_setting(SettingKey::AiSystemPrompt).await?,
        })
    }
}

/// Builds the concrete translator for a config tuple.
fn build_translator(
    config: &TranslatorConfig,
    client: &reqwest::Client,
) -> Result<Arc<dyn Translator>, EnrichError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockTranslator)),
        "google" => Ok(Arc::new(GoogleFreeTranslator {
            client: client.clone(),
        })),
        "deepl" => {
            if config.api_key.is_empty() {
                return Err(EnrichError::MissingCredentials("deepl"));
            }
            Ok(Arc::new(DeeplTranslator {
                client: client.clone(),
                api_key: SecretString::from(config.api_key.clone()),
            }))
        }
        "baidu" => {
            if config.api_key.is_empty() || config.app_id.is_empty() {
                return Err(EnrichError::MissingCredentials("baidu"));
            }
            Ok(Arc::new(BaiduTranslator {
                client: client.clone(),
                app_id: config.app_id.clone(),
                api_key: SecretString::from(config.api_key.clone()),
            }))
        }
        "ai" => {
            if config.api_key.is_empty() {
                return Err(EnrichError::MissingCredentials("ai"));
            }
            if !config.endpoint.starts_with("https://") {
                return Err(EnrichError::InsecureEndpoint(config.endpoint.clone()));
            }
            Ok(Arc::new(AiTranslator {
                client: client.clone(),
                endpoint: config.endpoint.clone(),
                api_key: SecretString::from(config.api_key.clone()),
                model: config.model.clone(),
                system_prompt: config.system_prompt.clone(),
            }))
        }
        other => Err(EnrichError::UnknownProvider(other.to_owned())),
    }
}

/// Read-mostly cache of the active translator, keyed by the config tuple.
///
/// Steady-state callers take the read lock, compare tuples and clone the
/// Arc; only a settings change pays for reconstruction.
#[derive(Default)]
pub struct TranslatorCache {
    inner: RwLock<Option<(TranslatorConfig, Arc<dyn Translator>)>>,
}

impl TranslatorCache {
    pub fn get(
        &self,
        config: &TranslatorConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn Translator>, EnrichError> {
        {
            let cached = self.inner.read();
            if let Some((cached_config, translator)) = cached.as_ref() {
                if cached_config == config {
                    return Ok(Arc::clone(translator));
                }
            }
        }

        let translator = build_translator(config, client)?;
        *self.inner.write() = Some((config.clone(), Arc::clone(&translator)));
        Ok(translator)
    }

    /// Translate through the active provider. Empty input returns empty
    /// without touching the cache or the network.
    pub async fn translate(
        &self,
        config: &TranslatorConfig,
        client: &reqwest::Client,
        text: &str,
        target_lang: &str,
    ) -> Result<String, EnrichError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        let translator = self.get(config, client)?;
        translator.translate(text, target_lang).await
    }
}
