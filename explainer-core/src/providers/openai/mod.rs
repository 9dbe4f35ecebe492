use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, ExplainerError};
use crate::http_client::{HttpClient, RequestCtx, SseLine, SseStream};
use crate::model::{ChatMessage, ChatRequest, ChatResponse, StopReason, Usage};
use crate::provider::ChatProvider;
use crate::stream::{BoxStreamEv, Fragment, StreamEvent};

/// OpenAI Chat Completions adapter. Also serves OpenAI-compatible local
/// servers such as Ollama, which take no API key.
#[derive(Debug, Clone)]
pub struct OpenAI {
    http: HttpClient,
    base: String,
    name: String, // "openai" or "ollama"
    api_key: Option<SecretString>,
}

impl OpenAI {
    pub fn new(http: HttpClient, api_key: SecretString, base: String) -> Self {
        Self {
            http,
            api_key: Some(api_key),
            base,
            name: "openai".into(),
        }
    }

    /// Local OpenAI-compatible server (no credentials).
    pub fn ollama(http: HttpClient, base: String) -> Self {
        Self {
            http,
            api_key: None,
            base,
            name: "ollama".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAI::new(
            HttpClient::new_default().unwrap(),
            SecretString::from("test-key".to_string()),
            server_base.to_string(),
        )
    }

    fn auth_header(&self) -> Option<String> {
        self.api_key
            .as_ref()
            .map(|key| format!("Bearer {}", key.expose_secret()))
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base.trim_end_matches('/'))
    }
}

// Chat Completions wire format, only the fields read or sent.
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OAStreamOptions>,
}

impl<'a> OAChatReq<'a> {
    fn from_req(req: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_output_tokens,
            stream,
            stream_options: stream.then_some(OAStreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Serialize)]
struct OAStreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct OAChatResp {
    id: String,
    choices: Vec<OAChoice>,
    usage: Option<OAUsage>,
}

#[derive(Deserialize)]
struct OAChoice {
    message: OAMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OAMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OAUsage> for Usage {
    fn from(u: OAUsage) -> Self {
        Usage {
            prompt: u.prompt_tokens,
            completion: u.completion_tokens,
        }
    }
}

#[derive(Deserialize)]
struct OAChunk {
    #[serde(default)]
    choices: Vec<OAChunkChoice>,
    #[serde(default)]
    usage: Option<OAUsage>,
    #[serde(default)]
    error: Option<OAError>,
}

#[derive(Deserialize)]
struct OAChunkChoice {
    #[serde(default)]
    delta: OADelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Per-stream decoding state.
struct SseState {
    lines: SseStream,
    provider: String,
    finish: Option<StopReason>,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

/// Decode one SSE line into zero or more events.
fn decode_line(line: &str, provider: &str, finish: &mut Option<StopReason>, out: &mut VecDeque<StreamEvent>) {
    if line.is_empty() || line.starts_with(':') {
        return;
    }
    // `event:`, `id:` and `retry:` fields carry nothing we use.
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        out.push_back(StreamEvent::Stop {
            reason: finish.take(),
        });
        return;
    }
    let chunk = match serde_json::from_str::<OAChunk>(data) {
        Ok(c) => c,
        Err(e) => {
            out.push_back(StreamEvent::Error(ExplainerError::ProviderError {
                provider: provider.to_string(),
                code: "malformed_chunk".into(),
                message: format!("json decode error: {e}"),
            }));
            return;
        }
    };
    if let Some(err) = chunk.error {
        out.push_back(StreamEvent::Error(ExplainerError::ProviderError {
            provider: provider.to_string(),
            code: err.code.unwrap_or_else(|| "stream_error".into()),
            message: err.message,
        }));
        return;
    }
    if let Some(choice) = chunk.choices.into_iter().next() {
        out.push_back(StreamEvent::Fragment(Fragment {
            text: choice.delta.content,
        }));
        if let Some(reason) = StopReason::from_finish(choice.finish_reason.as_deref()) {
            *finish = Some(reason);
        }
    }
    if let Some(u) = chunk.usage {
        out.push_back(StreamEvent::Usage(u.into()));
    }
}

/// Turn raw SSE lines into stream events, ending after the first terminal one.
/// If the body ends without `[DONE]` the event stream just ends too; the
/// accumulator reports that as a truncated transport.
fn events_from_sse(lines: SseStream, provider: &str) -> BoxStreamEv {
    let state = SseState {
        lines,
        provider: provider.to_string(),
        finish: None,
        pending: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            if let Some(ev) = st.pending.pop_front() {
                if ev.is_terminal() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((ev, st));
            }
            match st.lines.next().await {
                Some(Ok(SseLine { line })) => {
                    decode_line(&line, &st.provider, &mut st.finish, &mut st.pending);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((StreamEvent::Error(e), st));
                }
                None => return None,
            }
        }
    }))
}

#[async_trait]
impl ChatProvider for OpenAI {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let payload = OAChatReq::from_req(&req, false);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let auth = self.auth_header();
        let hdrs: Vec<(&str, &str)> = auth.iter().map(|a| ("Authorization", a.as_str())).collect();
        let (resp, provider_id, latency_ms) = self
            .http
            .post_json::<_, OAChatResp>(&self.url(), &payload, &hdrs, &ctx)
            .await?;

        let first = resp.choices.into_iter().next();
        let stop_reason = first
            .as_ref()
            .and_then(|c| StopReason::from_finish(c.finish_reason.as_deref()));
        let text = first.and_then(|c| c.message.content).unwrap_or_default();

        tracing::debug!(
            provider = %self.name,
            model = %req.model,
            latency_ms,
            bytes = text.len(),
            "chat completion received"
        );

        Ok(ChatResponse {
            model: req.model,
            text,
            usage: resp.usage.map(Usage::from),
            stop_reason,
            provider: self.name.clone(),
            provider_request_id: provider_id.or(Some(resp.id)),
            latency_ms,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let payload = OAChatReq::from_req(&req, true);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let auth = self.auth_header();
        let hdrs: Vec<(&str, &str)> = auth.iter().map(|a| ("Authorization", a.as_str())).collect();
        let (lines, provider_id) = self
            .http
            .post_sse_lines(&self.url(), &payload, &hdrs, &ctx)
            .await?;
        tracing::debug!(
            provider = %self.name,
            model = %req.model,
            provider_request_id = provider_id.as_deref().unwrap_or(""),
            "completion stream opened"
        );
        Ok(events_from_sse(lines, &self.name))
    }
}
