//! Turns an ordered stream of fragments into one final text.
//!
//! The consumer loop pulls exactly one event at a time and suspends only while
//! waiting for the next one. The buffer has a single writer (this loop), so no
//! locking is involved. Dropping the source on return releases whatever
//! connection backs it.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::StreamCfg;
use crate::error::{CoreResult, ExplainerError, TimeoutKind};
use crate::model::{ChatResponse, StopReason, Usage};
use crate::stream::StreamEvent;
use crate::telemetry::{
    self, KEY_ERROR_KIND, KEY_FINISH_REASON, KEY_STREAM_BYTES, KEY_STREAM_FRAGMENTS, KEY_STREAM_OUTCOME,
    KEY_TOKENS_TOTAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transport delivered its end marker.
    Complete,
    /// The caller aborted; `text` holds what arrived before that.
    Cancelled,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub status: CompletionStatus,
    pub stop_reason: Option<StopReason>,
    pub usage: Option<Usage>,
    /// Number of non-empty fragments appended.
    pub fragments: usize,
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        self.status == CompletionStatus::Complete
    }
}

/// Non-streaming variant: one full response becomes a single synthetic fragment.
pub fn get_once(response: ChatResponse) -> Completion {
    let fragments = usize::from(!response.text.is_empty());
    Completion {
        text: response.text,
        status: CompletionStatus::Complete,
        stop_reason: response.stop_reason,
        usage: response.usage,
        fragments,
    }
}

/// Streaming completion accumulator with optional timeouts and cancellation.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    fragment_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    provider: String,
    model: String,
}

enum Step {
    Event(Option<StreamEvent>),
    FragmentTimeout,
    TotalTimeout,
    Cancelled,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cfg(cfg: &StreamCfg) -> Self {
        let mut acc = Self::new();
        if cfg.fragment_timeout_ms > 0 {
            acc.fragment_timeout = Some(Duration::from_millis(cfg.fragment_timeout_ms));
        }
        if cfg.total_timeout_ms > 0 {
            acc.total_timeout = Some(Duration::from_millis(cfg.total_timeout_ms));
        }
        acc
    }

    /// Maximum wait for any single event.
    pub fn fragment_timeout(mut self, d: Duration) -> Self {
        self.fragment_timeout = Some(d);
        self
    }

    /// Maximum duration of the whole consumption.
    pub fn total_timeout(mut self, d: Duration) -> Self {
        self.total_timeout = Some(d);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Provider/model labels attached to the accumulation span.
    pub fn labels(mut self, provider: &str, model: &str) -> Self {
        self.provider = provider.to_string();
        self.model = model.to_string();
        self
    }

    pub async fn accumulate<S>(&self, source: S) -> CoreResult<Completion>
    where
        S: Stream<Item = StreamEvent>,
    {
        self.accumulate_with(source, |_| {}).await
    }

    /// Consume `source` to its end marker, calling `on_progress` with the
    /// cumulative text after every non-empty fragment.
    pub async fn accumulate_with<S, F>(&self, source: S, on_progress: F) -> CoreResult<Completion>
    where
        S: Stream<Item = StreamEvent>,
        F: FnMut(&str),
    {
        self.accumulate_opening(async move { Ok(source) }, on_progress)
            .await
    }

    /// Like `accumulate_with`, but `open` (the request that yields the
    /// stream) already runs under the cancel token and both time limits.
    /// A failed open is a transport failure with empty partial text.
    pub async fn accumulate_opening<O, S, F>(&self, open: O, on_progress: F) -> CoreResult<Completion>
    where
        O: Future<Output = CoreResult<S>>,
        S: Stream<Item = StreamEvent>,
        F: FnMut(&str),
    {
        let span = tracing::info_span!(
            "explainer.accumulate",
            llm.provider = %self.provider,
            llm.model = %self.model,
            stream.fragments = tracing::field::Empty,
            stream.bytes = tracing::field::Empty,
            stream.outcome = tracing::field::Empty,
            finish.reason = tracing::field::Empty,
            tokens.total = tracing::field::Empty,
            error.kind = tracing::field::Empty,
        );
        let res = self.open_and_consume(open, on_progress).instrument(span.clone()).await;

        span.record(KEY_STREAM_OUTCOME, telemetry::outcome_label(&res));
        match &res {
            Ok(c) => {
                span.record(KEY_STREAM_FRAGMENTS, c.fragments as u64);
                span.record(KEY_STREAM_BYTES, c.text.len() as u64);
                if let Some(reason) = c.stop_reason {
                    span.record(KEY_FINISH_REASON, reason.as_str());
                }
                if let Some(u) = c.usage {
                    span.record(KEY_TOKENS_TOTAL, u.total() as u64);
                }
                tracing::debug!(parent: &span, status = c.status.as_str(), "stream accumulated");
            }
            Err(e) => {
                let partial = e.partial_text().map(str::len).unwrap_or(0);
                span.record(KEY_STREAM_BYTES, partial as u64);
                span.record(KEY_ERROR_KIND, e.kind());
                tracing::warn!(parent: &span, error = %e, partial_bytes = partial, "stream accumulation failed");
            }
        }
        res
    }

    async fn open_and_consume<O, S, F>(&self, open: O, on_progress: F) -> CoreResult<Completion>
    where
        O: Future<Output = CoreResult<S>>,
        S: Stream<Item = StreamEvent>,
        F: FnMut(&str),
    {
        // The total budget starts before the request goes out.
        let deadline = self.total_timeout.map(|d| Instant::now() + d);
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Ok(interrupted(String::new(), None, 0));
        }
        let opened = tokio::select! {
            biased;
            _ = cancelled(self.cancel.as_ref()) => return Ok(interrupted(String::new(), None, 0)),
            _ = until(deadline) => {
                return Err(ExplainerError::Timeout {
                    partial: String::new(),
                    kind: TimeoutKind::Total,
                });
            }
            opened = within(open, self.fragment_timeout) => opened,
        };
        let source = match opened {
            Some(Ok(source)) => source,
            Some(Err(e)) => return Err(ExplainerError::transport("", e)),
            None => {
                return Err(ExplainerError::Timeout {
                    partial: String::new(),
                    kind: TimeoutKind::Fragment,
                });
            }
        };
        tracing::trace!("stream opened");
        self.consume(source, deadline, on_progress).await
    }

    async fn consume<S, F>(
        &self,
        source: S,
        deadline: Option<Instant>,
        mut on_progress: F,
    ) -> CoreResult<Completion>
    where
        S: Stream<Item = StreamEvent>,
        F: FnMut(&str),
    {
        let mut source = std::pin::pin!(source);
        let mut text = String::new();
        let mut fragments = 0usize;
        let mut usage = None;

        loop {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Ok(interrupted(text, usage, fragments));
            }

            let step = tokio::select! {
                biased;
                _ = cancelled(self.cancel.as_ref()) => Step::Cancelled,
                _ = until(deadline) => Step::TotalTimeout,
                step = next_event(source.as_mut(), self.fragment_timeout) => step,
            };

            match step {
                Step::Event(Some(StreamEvent::Fragment(f))) => {
                    if let Some(piece) = f.content() {
                        text.push_str(piece);
                        fragments += 1;
                        tracing::trace!(n = fragments, len = piece.len(), "fragment");
                        on_progress(&text);
                    }
                }
                Step::Event(Some(StreamEvent::Usage(u))) => usage = Some(u),
                Step::Event(Some(StreamEvent::Stop { reason })) => {
                    return Ok(Completion {
                        text,
                        status: CompletionStatus::Complete,
                        stop_reason: reason,
                        usage,
                        fragments,
                    });
                }
                Step::Event(Some(StreamEvent::Error(e))) => {
                    return Err(ExplainerError::transport(text, e));
                }
                Step::Event(None) => {
                    return Err(ExplainerError::transport(text, ExplainerError::Truncated));
                }
                Step::FragmentTimeout => {
                    return Err(ExplainerError::Timeout {
                        partial: text,
                        kind: TimeoutKind::Fragment,
                    });
                }
                Step::TotalTimeout => {
                    return Err(ExplainerError::Timeout {
                        partial: text,
                        kind: TimeoutKind::Total,
                    });
                }
                Step::Cancelled => {
                    return Ok(interrupted(text, usage, fragments));
                }
            }
        }
    }
}

async fn next_event<S>(mut source: Pin<&mut S>, per_event: Option<Duration>) -> Step
where
    S: Stream<Item = StreamEvent>,
{
    match per_event {
        Some(d) => match tokio::time::timeout(d, source.next()).await {
            Ok(ev) => Step::Event(ev),
            Err(_) => Step::FragmentTimeout,
        },
        None => Step::Event(source.next().await),
    }
}

fn interrupted(text: String, usage: Option<Usage>, fragments: usize) -> Completion {
    Completion {
        text,
        status: CompletionStatus::Cancelled,
        stop_reason: None,
        usage,
        fragments,
    }
}

/// `None` when `limit` elapses first.
async fn within<T>(fut: impl Future<Output = T>, limit: Option<Duration>) -> Option<T> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Fragment;
    use futures::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deltas(parts: &[&str]) -> Vec<StreamEvent> {
        parts.iter().map(|p| StreamEvent::delta(*p)).collect()
    }

    fn finished(parts: &[&str]) -> Vec<StreamEvent> {
        let mut evs = deltas(parts);
        evs.push(StreamEvent::Stop {
            reason: Some(StopReason::Stop),
        });
        evs
    }

    #[tokio::test]
    async fn fibonacci_example_reports_cumulative_prefixes() {
        let parts = ["The ", "fib", "onacci function ", "yields ", "terms."];
        let mut seen = Vec::new();
        let out = Accumulator::new()
            .accumulate_with(stream::iter(finished(&parts)), |t| seen.push(t.to_string()))
            .await
            .expect("complete");

        assert_eq!(out.text, "The fibonacci function yields terms.");
        assert!(out.is_complete());
        assert_eq!(out.fragments, 5);
        assert_eq!(
            seen,
            vec![
                "The ",
                "The fib",
                "The fibonacci function ",
                "The fibonacci function yields ",
                "The fibonacci function yields terms.",
            ]
        );
    }

    #[tokio::test]
    async fn absent_and_empty_fragments_are_skipped() {
        let events = vec![
            StreamEvent::Fragment(Fragment::absent()),
            StreamEvent::delta("a"),
            StreamEvent::delta(""),
            StreamEvent::Fragment(Fragment::absent()),
            StreamEvent::delta("b"),
            StreamEvent::Stop { reason: None },
        ];
        let mut calls = 0;
        let out = Accumulator::new()
            .accumulate_with(stream::iter(events), |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(out.fragments, 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn empty_stream_with_stop_is_empty_success() {
        let out = Accumulator::new()
            .accumulate(stream::iter(vec![StreamEvent::Stop { reason: None }]))
            .await
            .unwrap();
        assert_eq!(out.text, "");
        assert_eq!(out.fragments, 0);
        assert!(out.is_complete());
    }

    #[tokio::test]
    async fn streamed_and_one_shot_agree() {
        let parts = ["fn ", "main", "() {}", ""];
        let streamed = Accumulator::new()
            .accumulate(stream::iter(finished(&parts)))
            .await
            .unwrap();
        let once = get_once(ChatResponse {
            model: "m".into(),
            text: parts.concat(),
            usage: None,
            stop_reason: Some(StopReason::Stop),
            provider: "null".into(),
            provider_request_id: None,
            latency_ms: 0,
        });
        assert_eq!(streamed.text, once.text);
        assert_eq!(streamed.status, once.status);
        assert_eq!(streamed.stop_reason, once.stop_reason);
        assert_eq!(once.fragments, 1);
    }

    #[tokio::test]
    async fn transport_error_keeps_partial_text() {
        let mut events = deltas(&["f1", "f2"]);
        events.push(StreamEvent::Error(ExplainerError::ProviderUnavailable {
            provider: "http".into(),
        }));
        events.push(StreamEvent::delta("f3"));
        let err = Accumulator::new()
            .accumulate(stream::iter(events))
            .await
            .unwrap_err();
        match err {
            ExplainerError::Transport { partial, source } => {
                assert_eq!(partial, "f1f2");
                assert!(matches!(*source, ExplainerError::ProviderUnavailable { .. }));
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_end_marker_is_not_success() {
        let err = Accumulator::new()
            .accumulate(stream::iter(deltas(&["half an ", "answ"])))
            .await
            .unwrap_err();
        assert_eq!(err.partial_text(), Some("half an answ"));
        match err {
            ExplainerError::Transport { source, .. } => {
                assert!(matches!(*source, ExplainerError::Truncated))
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_is_pulled_after_the_end_marker() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let mut events = finished(&["a", "b"]);
        events.push(StreamEvent::delta("late"));
        let source = stream::iter(events).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut calls = 0;
        let out = Accumulator::new()
            .accumulate_with(source, |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn repeated_fragments_are_each_appended_once() {
        let out = Accumulator::new()
            .accumulate(stream::iter(finished(&["ha", "ha", "ha"])))
            .await
            .unwrap();
        assert_eq!(out.text, "hahaha");
        assert_eq!(out.fragments, 3);
    }

    #[tokio::test]
    async fn usage_and_stop_reason_are_carried() {
        let events = vec![
            StreamEvent::delta("x"),
            StreamEvent::Usage(Usage {
                prompt: 9,
                completion: 1,
            }),
            StreamEvent::Stop {
                reason: Some(StopReason::Length),
            },
        ];
        let out = Accumulator::new().accumulate(stream::iter(events)).await.unwrap();
        assert_eq!(out.usage, Some(Usage { prompt: 9, completion: 1 }));
        assert_eq!(out.stop_reason, Some(StopReason::Length));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_times_out_with_partial() {
        let source = stream::iter(deltas(&["before ", "stall"])).chain(stream::pending());
        let err = Accumulator::new()
            .fragment_timeout(Duration::from_secs(5))
            .accumulate(source)
            .await
            .unwrap_err();
        match err {
            ExplainerError::Timeout { partial, kind } => {
                assert_eq!(partial, "before stall");
                assert_eq!(kind, TimeoutKind::Fragment);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_hits_total_budget() {
        // One fragment per second, forever.
        let source = stream::unfold((), |()| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some((StreamEvent::delta("x"), ()))
        });
        let err = Accumulator::new()
            .fragment_timeout(Duration::from_secs(2))
            .total_timeout(Duration::from_millis(3_500))
            .accumulate(source)
            .await
            .unwrap_err();
        match err {
            ExplainerError::Timeout { partial, kind } => {
                assert_eq!(kind, TimeoutKind::Total);
                assert_eq!(partial, "xxx");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_mid_stream_stops_consumption() {
        let token = CancellationToken::new();
        let trip = token.clone();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(finished(&["one ", "two ", "three"])).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let out = Accumulator::new()
            .cancel_on(token)
            .accumulate_with(source, |t| {
                if t == "one two " {
                    trip.cancel();
                }
            })
            .await
            .unwrap();
        assert_eq!(out.status, CompletionStatus::Cancelled);
        assert_eq!(out.text, "one two ");
        assert_eq!(out.fragments, 2);
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_returns_partial() {
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trip.cancel();
        });
        let source = stream::iter(deltas(&["waiting"])).chain(stream::pending());
        let out = Accumulator::new()
            .cancel_on(token)
            .accumulate(source)
            .await
            .unwrap();
        assert_eq!(out.status, CompletionStatus::Cancelled);
        assert_eq!(out.text, "waiting");
    }

    #[tokio::test]
    async fn already_cancelled_pulls_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(finished(&["a"])).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let out = Accumulator::new().cancel_on(token).accumulate(source).await.unwrap();
        assert_eq!(out.status, CompletionStatus::Cancelled);
        assert_eq!(out.text, "");
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }

    /// An open that takes `delay` and then yields a finished stream.
    async fn slow_open(delay: Duration) -> CoreResult<stream::Iter<std::vec::IntoIter<StreamEvent>>> {
        tokio::time::sleep(delay).await;
        Ok(stream::iter(finished(&["late"])))
    }

    #[tokio::test(start_paused = true)]
    async fn open_without_headers_hits_fragment_timeout() {
        let started = Instant::now();
        let err = Accumulator::new()
            .fragment_timeout(Duration::from_millis(200))
            .accumulate_opening(slow_open(Duration::from_secs(3600)), |_| {})
            .await
            .unwrap_err();
        match err {
            ExplainerError::Timeout { partial, kind } => {
                assert_eq!(partial, "");
                assert_eq!(kind, TimeoutKind::Fragment);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn total_budget_covers_the_open() {
        let err = Accumulator::new()
            .total_timeout(Duration::from_millis(500))
            .accumulate_opening(slow_open(Duration::from_secs(3600)), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExplainerError::Timeout {
                kind: TimeoutKind::Total,
                ..
            }
        ));
        assert_eq!(err.partial_text(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn total_budget_counts_time_spent_opening() {
        // 400ms to open leaves 100ms for a stream that never finishes.
        let open = async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(stream::iter(deltas(&["x"])).chain(stream::pending()))
        };
        let err = Accumulator::new()
            .total_timeout(Duration::from_millis(500))
            .accumulate_opening(open, |_| {})
            .await
            .unwrap_err();
        match err {
            ExplainerError::Timeout { partial, kind } => {
                assert_eq!(kind, TimeoutKind::Total);
                assert_eq!(partial, "x");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_open_returns_cancelled() {
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trip.cancel();
        });
        let out = Accumulator::new()
            .cancel_on(token)
            .accumulate_opening(slow_open(Duration::from_secs(3600)), |_| {})
            .await
            .unwrap();
        assert_eq!(out.status, CompletionStatus::Cancelled);
        assert_eq!(out.text, "");
    }

    #[tokio::test]
    async fn failed_open_is_transport_with_empty_partial() {
        let open = async {
            Err::<stream::Empty<StreamEvent>, _>(ExplainerError::RateLimited {
                provider: "openai".into(),
                retry_after: Some(3),
            })
        };
        let err = Accumulator::new().accumulate_opening(open, |_| {}).await.unwrap_err();
        assert_eq!(err.partial_text(), Some(""));
        match err {
            ExplainerError::Transport { source, .. } => {
                assert!(matches!(*source, ExplainerError::RateLimited { .. }))
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_open_within_limits_streams_normally() {
        let out = Accumulator::new()
            .fragment_timeout(Duration::from_secs(5))
            .accumulate_opening(slow_open(Duration::from_millis(10)), |_| {})
            .await
            .unwrap();
        assert_eq!(out.text, "late");
        assert!(out.is_complete());
    }

    #[test]
    fn from_cfg_treats_zero_as_unbounded() {
        let acc = Accumulator::from_cfg(&StreamCfg {
            enabled: true,
            fragment_timeout_ms: 0,
            total_timeout_ms: 1_000,
        });
        assert_eq!(acc.fragment_timeout, None);
        assert_eq!(acc.total_timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn span_records_outcome_and_counts() {
        let (store, _guard) = crate::telemetry::test_span::install_capture();
        Accumulator::new()
            .labels("null", "gpt-4o-mini")
            .accumulate(stream::iter(finished(&["ab", "c"])))
            .await
            .unwrap();
        let fields = store.fields_of("explainer.accumulate").expect("span captured");
        assert_eq!(fields.get("llm.model").map(String::as_str), Some("gpt-4o-mini"));
        assert_eq!(fields.get("stream.outcome").map(String::as_str), Some("complete"));
        assert_eq!(fields.get("stream.fragments").map(String::as_str), Some("2"));
        assert_eq!(fields.get("stream.bytes").map(String::as_str), Some("3"));
        assert_eq!(fields.get("finish.reason").map(String::as_str), Some("stop"));
    }
}
