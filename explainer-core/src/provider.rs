use async_trait::async_trait;
use futures::stream;

use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse, StopReason, Usage};
use crate::stream::{BoxStreamEv, StreamEvent};

/// Transport seam: something that can answer a chat request whole or as a
/// stream of fragments.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse>;

    /// Streaming variant. Providers without native streaming fall back to one
    /// blocking call replayed as a single fragment.
    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let single = self.chat(req).await?;
        Ok(replay(single))
    }
}

/// Replay a full response as `[Fragment, Usage?, Stop]`.
pub fn replay(resp: ChatResponse) -> BoxStreamEv {
    let mut events = vec![StreamEvent::delta(resp.text)];
    if let Some(u) = resp.usage {
        events.push(StreamEvent::Usage(u));
    }
    events.push(StreamEvent::Stop {
        reason: resp.stop_reason,
    });
    Box::pin(stream::iter(events))
}

/// Offline provider that answers every request with the same canned text.
/// Streams it word by word, so both call styles yield identical text.
pub struct NullProvider {
    text: String,
}

impl NullProvider {
    pub const DEFAULT_TEXT: &'static str = "[null provider response]";

    pub fn new() -> Self {
        Self::with_text(Self::DEFAULT_TEXT)
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    fn response(&self, req: &ChatRequest) -> ChatResponse {
        ChatResponse {
            model: req.model.clone(),
            text: self.text.clone(),
            usage: Some(Usage {
                prompt: req.messages.iter().map(|m| m.content.len() as u32).sum(),
                completion: 0,
            }),
            stop_reason: Some(StopReason::Stop),
            provider: "null".into(),
            provider_request_id: None,
            latency_ms: 0,
        }
    }
}

impl Default for NullProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        Ok(self.response(&req))
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let resp = self.response(&req);
        let mut events: Vec<StreamEvent> = resp
            .text
            .split_inclusive(' ')
            .map(StreamEvent::delta)
            .collect();
        if let Some(u) = resp.usage {
            events.push(StreamEvent::Usage(u));
        }
        events.push(StreamEvent::Stop {
            reason: resp.stop_reason,
        });
        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;
    use futures::StreamExt;

    fn req() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::system("s"), ChatMessage::user("hi")],
            temperature: None,
            max_output_tokens: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn null_provider_chat() {
        let prov = NullProvider::new();
        let resp = prov.chat(req()).await.expect("chat ok");
        assert_eq!(resp.provider, "null");
        assert_eq!(resp.text, "[null provider response]");
        assert_eq!(resp.usage.map(|u| u.prompt), Some(3));
    }

    #[tokio::test]
    async fn null_provider_streams_words_then_stop() {
        let prov = NullProvider::with_text("one two three");
        let events: Vec<StreamEvent> = prov.chat_stream(req()).await.unwrap().collect().await;
        let texts: Vec<&str> = events.iter().filter_map(|e| e.as_text_delta()).collect();
        assert_eq!(texts, vec!["one ", "two ", "three"]);
        assert!(events.last().is_some_and(StreamEvent::is_terminal));
    }

    struct OnlyChat;

    #[async_trait]
    impl ChatProvider for OnlyChat {
        fn name(&self) -> &str {
            "only-chat"
        }
        async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
            Ok(ChatResponse {
                model: req.model,
                text: "whole".into(),
                usage: None,
                stop_reason: Some(StopReason::Length),
                provider: "only-chat".into(),
                provider_request_id: None,
                latency_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn default_stream_replays_single_response() {
        let events: Vec<StreamEvent> = OnlyChat.chat_stream(req()).await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_text_delta(), Some("whole"));
        assert!(matches!(
            events[1],
            StreamEvent::Stop {
                reason: Some(StopReason::Length)
            }
        ));
    }
}
