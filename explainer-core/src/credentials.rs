//! API key lookup and sanity checks, run before any request is made.

use secrecy::SecretString;

use crate::config::ProviderKind;
use crate::error::{CoreResult, ExplainerError};

/// Prefix every OpenAI secret key starts with (`sk-`, `sk-proj-`, ...).
const OPENAI_KEY_PREFIX: &str = "sk-";

/// Read the process environment. Pass this as `lookup` in production.
pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Fetch the key named by `var` through `lookup` and validate its shape.
pub fn resolve_api_key<L>(provider: ProviderKind, var: &str, lookup: L) -> CoreResult<SecretString>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(var).ok_or_else(|| {
        ExplainerError::Configuration(format!("no API key found: environment variable {var} is not set"))
    })?;
    if raw.is_empty() {
        return Err(ExplainerError::Configuration(format!("API key in {var} is empty")));
    }
    if raw.trim() != raw {
        return Err(ExplainerError::Configuration(format!(
            "API key in {var} has leading or trailing whitespace; remove it"
        )));
    }
    if provider == ProviderKind::OpenAI && !raw.starts_with(OPENAI_KEY_PREFIX) {
        return Err(ExplainerError::Configuration(format!(
            "API key in {var} does not look like an OpenAI key (expected prefix {OPENAI_KEY_PREFIX})"
        )));
    }
    tracing::debug!(var, provider = provider.as_str(), "API key found");
    Ok(SecretString::from(raw))
}
