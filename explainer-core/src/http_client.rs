use std::fmt::Display;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, ExplainerError, TimeoutKind};

/// Longest error body kept in `ProviderError::message`.
const MAX_ERROR_BODY: usize = 300;

/// Headers providers use to echo a request id, in lookup order.
const REQUEST_ID_HEADERS: [&str; 3] = ["x-request-id", "openai-request-id", "request-id"];

/// Per-call metadata sent along with the body.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    /// Correlation id forwarded as `X-Request-Id`.
    pub request_id: Option<&'a str>,
}

/// One raw line of an event-stream body, without its line terminator.
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

/// Shared reqwest client for completion endpoints.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    /// The request timeout applies to `post_json` only; streamed bodies are
    /// bounded by the accumulator's limits instead.
    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ExplainerError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("explainer/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    fn build<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> RequestBuilder {
        let mut req = self.inner.post(url).header("User-Agent", &self.user_agent).json(body);
        for &(name, value) in headers {
            req = req.header(name, value);
        }
        match ctx.request_id {
            Some(id) => req.header("X-Request-Id", id),
            None => req,
        }
    }

    /// Send and turn any non-2xx status into an error. Returns the response
    /// with the provider's request id when one was echoed.
    async fn send(&self, req: RequestBuilder, url: &str) -> CoreResult<(Response, Option<String>)> {
        let resp = req.send().await.map_err(|e| {
            tracing::debug!(error = %e, url, timed_out = e.is_timeout(), "no response from endpoint");
            send_error(&e)
        })?;
        let status = resp.status();
        let request_id = request_id(resp.headers());
        if status.is_success() {
            return Ok((resp, request_id));
        }
        let retry_after = retry_after(resp.headers());
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(error = %e, %status, url, "could not read error body");
                String::new()
            }
        };
        tracing::debug!(%status, url, request_id = request_id.as_deref().unwrap_or(""), "endpoint refused request");
        Err(status_error("http", status, retry_after, &body))
    }

    /// POST a JSON body and decode a JSON reply.
    /// Returns `(body, provider_request_id, latency_ms)`.
    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let started = Instant::now();
        let req = self.build(url, body, headers, ctx).timeout(self.request_timeout);
        let (resp, request_id) = self.send(req, url).await?;
        let status = resp.status();
        let decoded = resp.json::<R>().await.map_err(|e| {
            if e.is_timeout() {
                return send_error(&e);
            }
            ExplainerError::ProviderError {
                provider: "http".into(),
                code: status.as_u16().to_string(),
                message: format!("json decode error: {e}"),
            }
        })?;
        let latency_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
        Ok((decoded, request_id, latency_ms))
    }

    /// POST a JSON body and return the reply as a lazy stream of lines.
    /// The connection stays open until the stream is dropped.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(SseStream, Option<String>)> {
        let req = self
            .build(url, body, headers, ctx)
            .header("Accept", "text/event-stream");
        let (resp, request_id) = self.send(req, url).await?;
        Ok((split_lines(resp.bytes_stream()), request_id))
    }
}

/// A request that hit `request_timeout` used up the whole budget; anything
/// else means the endpoint could not be reached.
fn send_error(e: &reqwest::Error) -> ExplainerError {
    if e.is_timeout() {
        ExplainerError::Timeout {
            partial: String::new(),
            kind: TimeoutKind::Total,
        }
    } else {
        ExplainerError::ProviderUnavailable {
            provider: "http".into(),
        }
    }
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| headers.get(*name)?.to_str().ok())
        .map(str::to_string)
}

/// Delay-seconds form of `Retry-After`; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers.get("retry-after")?.to_str().ok()?.trim().parse().ok()
}

fn status_error(provider: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> ExplainerError {
    let provider = provider.to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ExplainerError::RateLimited { provider, retry_after }
    } else if status.is_server_error() {
        ExplainerError::ProviderUnavailable { provider }
    } else {
        ExplainerError::ProviderError {
            provider,
            code: status.as_u16().to_string(),
            message: clip(body, MAX_ERROR_BODY),
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

struct Splitter<S> {
    chunks: S,
    buf: Vec<u8>,
    eof: bool,
}

impl<S> Splitter<S> {
    /// Next complete line in the buffer. At end of body the remainder counts
    /// as a final line.
    fn take_line(&mut self) -> Option<String> {
        let raw: Vec<u8> = match self.buf.iter().position(|b| *b == b'\n') {
            Some(idx) => {
                let mut raw: Vec<u8> = self.buf.drain(..=idx).collect();
                raw.pop();
                raw
            }
            None if self.eof && !self.buf.is_empty() => std::mem::take(&mut self.buf),
            None => return None,
        };
        let raw = raw.strip_suffix(b"\r").unwrap_or(&raw);
        Some(String::from_utf8_lossy(raw).into_owned())
    }
}

/// Split a byte stream on `\n` (tolerating `\r\n`). Splitting happens on bytes
/// so a multi-byte character cut across chunks survives.
fn split_lines<S, E>(chunks: S) -> SseStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send,
{
    let state = Splitter {
        chunks: Box::pin(chunks),
        buf: Vec::new(),
        eof: false,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.take_line() {
                return Some((Ok(SseLine { line }), st));
            }
            if st.eof {
                return None;
            }
            match st.chunks.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "body read failed mid-stream");
                    st.eof = true;
                    st.buf.clear();
                    let err = ExplainerError::ProviderUnavailable {
                        provider: "http".into(),
                    };
                    return Some((Err(err), st));
                }
                None => st.eof = true,
            }
        }
    }))
}
