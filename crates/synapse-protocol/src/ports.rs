//! Runtime boundary ports.
//!
//! These traits define the only allowed runtime boundary between the agent
//! core and external provider integrations. Implementations own retries,
//! key rotation and provider fallback; the core sees only ok/not-ok and
//! text.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KernelResult;

/// One text-generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

impl Generation {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            text: reason.into(),
            ok: false,
            tokens: None,
        }
    }
}

/// Embedding + text-generation provider boundary.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single text. An empty vector means the provider declined.
    async fn embed(&self, text: &str) -> KernelResult<Vec<f32>>;

    /// Embed a batch of texts, one vector per input, order-preserving.
    async fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>>;

    /// Produce the next free-form model turn for a composed prompt.
    async fn generate_text(&self, prompt: &str) -> KernelResult<Generation>;
}
