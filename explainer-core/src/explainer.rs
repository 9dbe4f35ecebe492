//! Task entry points: build a prompt, call the provider once, and either take
//! the whole answer or accumulate it fragment by fragment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::field::Empty;

use crate::accumulator::{self, Accumulator, Completion, CompletionStatus};
use crate::config::{Config, PromptsCfg, StreamCfg};
use crate::error::{CoreResult, ExplainerError};
use crate::model::ChatRequest;
use crate::normalizer::normalize_chat;
use crate::prompt::{Page, Prompt};
use crate::provider::ChatProvider;
use crate::telemetry::{
    KEY_ERROR_KIND, KEY_FINISH_REASON, KEY_LATENCY_MS, KEY_PROVIDER_REQUEST_ID, KEY_TOKENS_TOTAL,
};

pub struct Explainer {
    provider: Arc<dyn ChatProvider>,
    /// Used for both call styles; there is no second source.
    model: String,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    stream_cfg: StreamCfg,
    prompts: PromptsCfg,
    seq: AtomicU64,
}

impl Explainer {
    pub fn from_config(cfg: &Config, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            provider,
            model: cfg.llm.model.clone(),
            temperature: cfg.llm.temperature,
            max_output_tokens: cfg.llm.max_output_tokens,
            stream_cfg: cfg.stream.clone(),
            prompts: cfg.prompts.clone(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn streaming(&self) -> bool {
        self.stream_cfg.enabled
    }

    fn request(&self, prompt: &Prompt) -> ChatRequest {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        normalize_chat(ChatRequest {
            model: self.model.clone(),
            messages: prompt.messages().to_vec(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            request_id: Some(format!("explainer-{n}")),
        })
    }

    /// One blocking call; the full answer becomes a single fragment. Failures
    /// carry the same shape as a stream that failed before its first fragment.
    pub async fn get_once(&self, prompt: &Prompt) -> CoreResult<Completion> {
        let req = self.request(prompt);
        let span = tracing::info_span!(
            "explainer.get_once",
            llm.provider = self.provider.name(),
            llm.model = %self.model,
            req.id = req.request_id.as_deref().unwrap_or_default(),
            llm.req_id = Empty,
            latency.ms = Empty,
            tokens.total = Empty,
            finish.reason = Empty,
            error.kind = Empty,
        );
        let res = self.provider.chat(req).instrument(span.clone()).await;
        match res {
            Ok(resp) => {
                span.record(KEY_LATENCY_MS, resp.latency_ms);
                if let Some(id) = resp.provider_request_id.as_deref() {
                    span.record(KEY_PROVIDER_REQUEST_ID, id);
                }
                if let Some(u) = resp.usage {
                    span.record(KEY_TOKENS_TOTAL, u.total());
                }
                if let Some(reason) = resp.stop_reason {
                    span.record(KEY_FINISH_REASON, reason.as_str());
                }
                tracing::debug!(parent: &span, bytes = resp.text.len(), "blocking completion received");
                Ok(accumulator::get_once(resp))
            }
            Err(e) => {
                let e = match e {
                    ExplainerError::Configuration(_) | ExplainerError::Timeout { .. } => e,
                    other => ExplainerError::transport("", other),
                };
                span.record(KEY_ERROR_KIND, e.kind());
                tracing::warn!(parent: &span, error = %e, "blocking completion failed");
                Err(e)
            }
        }
    }

    /// Streamed call. Opening the stream runs under the same timeouts and
    /// cancellation as reading it; a failed open is a transport fault with
    /// empty partial text.
    pub async fn stream<F>(
        &self,
        prompt: &Prompt,
        cancel: Option<CancellationToken>,
        on_progress: F,
    ) -> CoreResult<Completion>
    where
        F: FnMut(&str),
    {
        let mut acc = Accumulator::from_cfg(&self.stream_cfg).labels(self.provider.name(), &self.model);
        if let Some(token) = cancel {
            acc = acc.cancel_on(token);
        }
        let open = self.provider.chat_stream(self.request(prompt));
        acc.accumulate_opening(open, on_progress).await
    }

    /// Stream or call once depending on `stream.enabled`.
    pub async fn run<F>(
        &self,
        prompt: &Prompt,
        cancel: Option<CancellationToken>,
        on_progress: F,
    ) -> CoreResult<Completion>
    where
        F: FnMut(&str),
    {
        if self.stream_cfg.enabled {
            return self.stream(prompt, cancel, on_progress).await;
        }
        let Some(token) = cancel else {
            return self.get_once(prompt).await;
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(Completion {
                text: String::new(),
                status: CompletionStatus::Cancelled,
                stop_reason: None,
                usage: None,
                fragments: 0,
            }),
            res = self.get_once(prompt) => res,
        }
    }

    pub async fn explain_code<F>(
        &self,
        snippet: &str,
        cancel: Option<CancellationToken>,
        on_progress: F,
    ) -> CoreResult<Completion>
    where
        F: FnMut(&str),
    {
        let prompt = Prompt::explain_code(&self.prompts.explain_code, snippet);
        self.run(&prompt, cancel, on_progress).await
    }

    pub async fn summarize_page<F>(
        &self,
        page: &Page,
        cancel: Option<CancellationToken>,
        on_progress: F,
    ) -> CoreResult<Completion>
    where
        F: FnMut(&str),
    {
        let prompt = Prompt::summarize_page(&self.prompts.summarize_page, page);
        self.run(&prompt, cancel, on_progress).await
    }
}
