/// Span attribute keys for provider calls and stream accumulation.
/// Keep these stable; log queries filter on them.
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_REQUEST_ID: &str = "req.id";
pub const KEY_PROVIDER_REQUEST_ID: &str = "llm.req_id";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_FINISH_REASON: &str = "finish.reason";
pub const KEY_TOKENS_TOTAL: &str = "tokens.total";

pub const KEY_STREAM_FRAGMENTS: &str = "stream.fragments";
pub const KEY_STREAM_BYTES: &str = "stream.bytes";
pub const KEY_STREAM_OUTCOME: &str = "stream.outcome";

pub const KEY_ERROR_KIND: &str = "error.kind";
