use thiserror::Error;

/// Which limit a stalled stream ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No event arrived within the per-fragment window.
    Fragment,
    /// The whole stream ran past its total budget.
    Total,
}

/// Core error type for explainer.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
///
/// `Transport` and `Timeout` always carry the text accumulated before the
/// failure so callers can decide whether a partial answer is usable.
/// Cancellation is not an error; see `accumulator::CompletionStatus`.
#[derive(Debug, Error)]
pub enum ExplainerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport failed after {} bytes: {source}", .partial.len())]
    Transport {
        partial: String,
        #[source]
        source: Box<ExplainerError>,
    },

    #[error("timed out ({kind:?}) after {} bytes", .partial.len())]
    Timeout { partial: String, kind: TimeoutKind },

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("stream ended without an end marker")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExplainerError {
    /// Wrap a transport-level fault together with the text seen so far.
    pub fn transport(partial: impl Into<String>, source: ExplainerError) -> Self {
        Self::Transport {
            partial: partial.into(),
            source: Box::new(source),
        }
    }

    /// Partial text attached to `Transport` and `Timeout` failures.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::Transport { partial, .. } | Self::Timeout { partial, .. } => {
                Some(partial.as_str())
            }
            _ => None,
        }
    }

    /// Short, stable label for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Truncated => "truncated",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ExplainerError>;
