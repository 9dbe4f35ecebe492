//! Streaming primitives: what a transport hands to the accumulator.
//!
//! Contract:
//! - Providers emit 0..n `Fragment` events, possibly interleaved with `Usage` updates.
//! - The stream **must** terminate with exactly one terminal event: `Stop` or `Error`.
//! - After a terminal event, no further events are emitted.
//! - A stream that simply runs dry without `Stop` was cut short; consumers treat it
//!   as a transport failure, never as a complete answer.
//!
//! This module intentionally avoids deriving `Clone` / `PartialEq` on `StreamEvent`
//! because `Error` contains `ExplainerError`, which is not `Clone` or `Eq`.

use crate::model::{StopReason, Usage};

/// One piece of generated text. `None` (or an empty string) carries no content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub text: Option<String>,
}

impl Fragment {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: Some(s.into()),
        }
    }

    pub fn absent() -> Self {
        Self { text: None }
    }

    /// The fragment's content if it would contribute anything when appended.
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().filter(|s| !s.is_empty())
    }
}

/// What the caller receives incrementally.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    Fragment(Fragment),
    /// Token usage, typically sent once just before the end marker.
    Usage(Usage),
    /// Explicit end-of-stream marker.
    Stop { reason: Option<StopReason> },
    /// Transport/parse error surfaced mid-stream; stream ends after this.
    Error(crate::error::ExplainerError),
}

impl StreamEvent {
    /// Shorthand for a text fragment event.
    pub fn delta(s: impl Into<String>) -> Self {
        Self::Fragment(Fragment::text(s))
    }

    /// Returns true if this event terminates the stream (`Stop` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error(_))
    }

    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::Fragment(f) => f.content(),
            _ => None,
        }
    }
}

/// Boxed stream of streaming events. Providers that support streaming return this.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;
