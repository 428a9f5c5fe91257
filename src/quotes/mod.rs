// =============================================================================
// Quote Sources
// =============================================================================
//
// The upstream provider is an external collaborator with a fixed text
// grammar; all provider specifics stay inside `sina.rs` so swapping providers
// is a one-file change. `synthetic.rs` is the WS_TEST_MODE substitute.

pub mod sina;
pub mod synthetic;

pub use sina::SinaQuoteSource;
pub use synthetic::SyntheticQuoteSource;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::Quote;

/// Result of one batched fetch: parsed quotes keyed by ts-code, plus the
/// codes that could not be served this round.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub quotes: HashMap<String, Quote>,
    pub failed: Vec<String>,
}

/// Batched, idempotent, side-effect-free quote retrieval.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_batch(&self, codes: &[String]) -> FetchOutcome;
}
