use std::sync::Arc;

use url::Url;

use crate::config::{Config, ProviderKind};
use crate::credentials::resolve_api_key;
use crate::error::{CoreResult, ExplainerError};
use crate::http_client::HttpClient;
use crate::provider::{ChatProvider, NullProvider};
use crate::providers::openai::OpenAI;

/// Build the single configured chat provider.
///
/// `lookup` resolves environment variables; pass
/// [`crate::credentials::env_lookup`] outside of tests. Keys are checked here,
/// so a bad setup fails before the first request is sent.
pub fn build_provider<L>(cfg: &Config, lookup: L) -> CoreResult<Arc<dyn ChatProvider>>
where
    L: Fn(&str) -> Option<String>,
{
    let kind = cfg.llm.provider;
    let base = match kind {
        ProviderKind::Null => {
            tracing::info!(provider = kind.as_str(), "using offline provider");
            return Ok(Arc::new(NullProvider::new()));
        }
        _ => validate_base(cfg.llm.base_url())?,
    };
    let http = HttpClient::from_cfg(&cfg.http)?;
    let provider: Arc<dyn ChatProvider> = if kind == ProviderKind::OpenAI {
        let key = resolve_api_key(kind, &cfg.llm.api_key_env, lookup)?;
        Arc::new(OpenAI::new(http, key, base.clone()))
    } else {
        Arc::new(OpenAI::ollama(http, base.clone()))
    };
    tracing::info!(provider = kind.as_str(), base = %base, model = %cfg.llm.model, "provider ready");
    Ok(provider)
}

fn validate_base(raw: &str) -> CoreResult<String> {
    let url = Url::parse(raw)
        .map_err(|e| ExplainerError::Configuration(format!("invalid base_url {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ExplainerError::Configuration(format!(
            "base_url must be http or https, got {}",
            url.scheme()
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}
