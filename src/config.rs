//! Provider settings and client construction.
//!
//! Every setting resolves through [`resolve`]: command-line flag, then
//! environment variable, then the value stored in the index database, then
//! the built-in default. Blank values at any level are treated as absent.

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    embedding::{DEFAULT_EMBED_MODEL, EmbeddingProvider, VoyageEmbedder},
    error::{Error, Result},
    http::{ApiClient, DEFAULT_TIMEOUT},
    llm::{DEFAULT_CHAT_MODEL, LlmProvider, OpenAiChat},
    reranker::{DEFAULT_RERANK_MODEL, Reranker, VoyageReranker},
    store::IndexStore,
};

pub const DEFAULT_VOYAGE_URL: &str = "https://api.voyageai.com/v1";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// A configurable value, addressable by environment variable and by its
/// key in the settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    VoyageApiKey,
    OpenAiApiKey,
    EmbedModel,
    RerankModel,
    ChatModel,
    VoyageUrl,
    OpenAiUrl,
}

impl Setting {
    pub const ALL: [Setting; 7] = [
        Setting::VoyageApiKey,
        Setting::OpenAiApiKey,
        Setting::EmbedModel,
        Setting::RerankModel,
        Setting::ChatModel,
        Setting::VoyageUrl,
        Setting::OpenAiUrl,
    ];

    pub fn env_var(self) -> &'static str {
        match self {
            Setting::VoyageApiKey => "VOYAGE_API_KEY",
            Setting::OpenAiApiKey => "OPENAI_API_KEY",
            Setting::EmbedModel => "DOCRAG_EMBED_MODEL",
            Setting::RerankModel => "DOCRAG_RERANK_MODEL",
            Setting::ChatModel => "DOCRAG_CHAT_MODEL",
            Setting::VoyageUrl => "DOCRAG_VOYAGE_URL",
            Setting::OpenAiUrl => "DOCRAG_OPENAI_URL",
        }
    }

    /// Key in the settings table.
    pub fn key(self) -> &'static str {
        match self {
            Setting::VoyageApiKey => "voyage_api_key",
            Setting::OpenAiApiKey => "openai_api_key",
            Setting::EmbedModel => "embed_model",
            Setting::RerankModel => "rerank_model",
            Setting::ChatModel => "chat_model",
            Setting::VoyageUrl => "voyage_url",
            Setting::OpenAiUrl => "openai_url",
        }
    }

    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Setting::VoyageApiKey | Setting::OpenAiApiKey => None,
            Setting::EmbedModel => Some(DEFAULT_EMBED_MODEL),
            Setting::RerankModel => Some(DEFAULT_RERANK_MODEL),
            Setting::ChatModel => Some(DEFAULT_CHAT_MODEL),
            Setting::VoyageUrl => Some(DEFAULT_VOYAGE_URL),
            Setting::OpenAiUrl => Some(DEFAULT_OPENAI_URL),
        }
    }

    pub fn is_secret(self) -> bool {
        matches!(self, Setting::VoyageApiKey | Setting::OpenAiApiKey)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

impl std::fmt::Display for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Pick the first non-blank value in precedence order.
///
/// ```
/// use docrag::config::resolve;
///
/// let value = resolve(None, Some("env"), Some("stored"), Some("d"));
/// assert_eq!(value.as_deref(), Some("env"));
/// let value = resolve(Some("  "), None, None, Some("d"));
/// assert_eq!(value.as_deref(), Some("d"));
/// assert_eq!(resolve(None, None, None, None), None);
/// ```
pub fn resolve(
    flag: Option<&str>,
    env: Option<&str>,
    stored: Option<&str>,
    default: Option<&str>,
) -> Option<String> {
    [flag, env, stored, default]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub embed_model: Option<String>,
    pub rerank_model: Option<String>,
    pub chat_model: Option<String>,
}

impl Overrides {
    fn get(&self, setting: Setting) -> Option<&str> {
        match setting {
            Setting::EmbedModel => self.embed_model.as_deref(),
            Setting::RerankModel => self.rerank_model.as_deref(),
            Setting::ChatModel => self.chat_model.as_deref(),
            _ => None,
        }
    }
}

/// Fully resolved provider settings.
#[derive(Clone, Default)]
pub struct Settings {
    values: HashMap<Setting, String>,
}

impl Settings {
    /// Resolve every setting against the process environment and the
    /// settings stored in `store`.
    pub async fn load(
        store: &dyn IndexStore,
        overrides: &Overrides,
    ) -> Result<Self> {
        let mut stored = HashMap::new();
        for setting in Setting::ALL {
            if let Some(value) = store.get_setting(setting.key()).await? {
                stored.insert(setting, value);
            }
        }
        Ok(Self::from_sources(
            overrides,
            |name| std::env::var(name).ok(),
            &stored,
        ))
    }

    /// Resolve from explicit sources. `env` looks up an environment
    /// variable by name.
    pub fn from_sources(
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
        stored: &HashMap<Setting, String>,
    ) -> Self {
        let values = Setting::ALL
            .into_iter()
            .filter_map(|setting| {
                let env_value = env(setting.env_var());
                resolve(
                    overrides.get(setting),
                    env_value.as_deref(),
                    stored.get(&setting).map(String::as_str),
                    setting.default_value(),
                )
                .map(|value| (setting, value))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, setting: Setting) -> Option<&str> {
        self.values.get(&setting).map(String::as_str)
    }

    /// The value with secrets masked, for display.
    pub fn display_value(&self, setting: Setting) -> String {
        match self.get(setting) {
            None => "(unset)".to_string(),
            Some(value) if setting.is_secret() => mask(value),
            Some(value) => value.to_string(),
        }
    }

    fn require(&self, setting: Setting) -> Result<&str> {
        self.get(setting)
            .ok_or(Error::MissingCredential(setting.env_var()))
    }

    fn or_default(&self, setting: Setting) -> &str {
        self.get(setting)
            .or(setting.default_value())
            .unwrap_or_default()
    }

    pub fn embed_model(&self) -> &str {
        self.or_default(Setting::EmbedModel)
    }

    pub fn rerank_model(&self) -> &str {
        self.or_default(Setting::RerankModel)
    }

    pub fn chat_model(&self) -> &str {
        self.or_default(Setting::ChatModel)
    }

    fn voyage_client(&self, timeout: Duration) -> Result<ApiClient> {
        ApiClient::new(
            "voyage",
            self.or_default(Setting::VoyageUrl),
            self.require(Setting::VoyageApiKey)?,
            timeout,
        )
    }

    /// The document and query embedder. Fails without a Voyage key.
    pub fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let client = self.voyage_client(DEFAULT_TIMEOUT)?;
        Ok(Arc::new(VoyageEmbedder::new(client, self.embed_model())))
    }

    /// The rerank stage, a passthrough when no Voyage key is configured.
    pub fn reranker(&self) -> Result<Reranker> {
        if self.get(Setting::VoyageApiKey).is_none() {
            tracing::debug!("no Voyage key, reranking disabled");
            return Ok(Reranker::passthrough());
        }
        let client = self.voyage_client(DEFAULT_TIMEOUT)?;
        Ok(Reranker::new(Arc::new(VoyageReranker::new(
            client,
            self.rerank_model(),
        ))))
    }

    /// The chat model client. Fails without an OpenAI key.
    pub fn llm(&self) -> Result<Arc<dyn LlmProvider>> {
        let client = ApiClient::new(
            "openai",
            self.or_default(Setting::OpenAiUrl),
            self.require(Setting::OpenAiApiKey)?,
            DEFAULT_TIMEOUT,
        )?;
        Ok(Arc::new(OpenAiChat::new(client)))
    }

    /// Fail fast with [`Error::MissingCredential`] if any of `required` is
    /// unset.
    pub fn require_all(&self, required: &[Setting]) -> Result<()> {
        required
            .iter()
            .try_for_each(|&setting| self.require(setting).map(|_| ()))
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for setting in Setting::ALL {
            map.entry(&setting.key(), &self.display_value(setting));
        }
        map.finish()
    }
}

fn mask(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 8 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{tail}")
}
