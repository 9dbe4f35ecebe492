use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ContentFilter,
    ToolUse,
    Other,
}

impl StopReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_finish(s: Option<&str>) -> Option<Self> {
        match s {
            Some("stop") => Some(Self::Stop),
            Some("length") => Some(Self::Length),
            Some("content_filter") => Some(Self::ContentFilter),
            Some("tool_calls") => Some(Self::ToolUse),
            Some(_) => Some(Self::Other),
            None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolUse => "tool_use",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt: u32,
    pub completion: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt.saturating_add(self.completion)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatResponse {
    pub model: String,
    pub text: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<StopReason>,
    pub provider: String,
    pub provider_request_id: Option<String>,
    pub latency_ms: u32,
}
