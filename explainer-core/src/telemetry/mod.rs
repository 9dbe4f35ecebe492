//! Tracing conventions shared by the accumulator and the providers.
//!
//! Nothing here installs a subscriber; the binary (or the embedding
//! application) decides where spans go.

pub mod keys;
#[cfg(test)]
pub mod test_span;

pub use keys::*;

/// Outcome label recorded under `stream.outcome`.
pub fn outcome_label(res: &crate::error::CoreResult<crate::accumulator::Completion>) -> &'static str {
    match res {
        Ok(c) => c.status.as_str(),
        Err(e) => e.kind(),
    }
}
