use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::prompt::Task;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Hosted OpenAI Chat Completions API.
    #[default]
    OpenAI,
    /// Local model server speaking the OpenAI-compatible API.
    Ollama,
    /// Offline canned responses.
    Null,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
            Self::Null => "null",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com",
            Self::Ollama => "http://localhost:11434",
            Self::Null => "",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LlmCfg {
    #[serde(default)]
    pub provider: ProviderKind,
    /// The one model identifier used for every call, streamed or not.
    #[serde(default = "default_model")]
    pub model: String,
    /// Overrides the provider's default endpoint base.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl LlmCfg {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PromptsCfg {
    #[serde(default = "default_explain_code")]
    pub explain_code: String,
    #[serde(default = "default_summarize_page")]
    pub summarize_page: String,
}

impl Default for PromptsCfg {
    fn default() -> Self {
        Self {
            explain_code: default_explain_code(),
            summarize_page: default_summarize_page(),
        }
    }
}

fn default_explain_code() -> String {
    Task::ExplainCode.default_system_prompt().to_string()
}
fn default_summarize_page() -> String {
    Task::SummarizePage.default_system_prompt().to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Stream responses fragment by fragment (false = one blocking call).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum wait for the next fragment in milliseconds (0 = unbounded).
    #[serde(default = "default_fragment_timeout_ms")]
    pub fragment_timeout_ms: u64,
    /// Maximum duration of a whole stream in milliseconds (0 = unbounded).
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            fragment_timeout_ms: default_fragment_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_fragment_timeout_ms() -> u64 {
    30_000
}
fn default_total_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for non-streaming requests in milliseconds (default 60000ms).
    /// Streaming bodies are bounded by `StreamCfg` instead.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmCfg,
    #[serde(default)]
    pub prompts: PromptsCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::ExplainerError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::ExplainerError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ExplainerError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::ExplainerError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ExplainerError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::ExplainerError::Other(e.into()))
                })?,
        };
        tracing::debug!(path = %path.display(), provider = cfg.llm.provider.as_str(), model = %cfg.llm.model, "config loaded");
        Ok(cfg)
    }
}
