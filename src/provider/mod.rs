//! Embedding Provider Adapter (C5): a uniform interface over remote and
//! local embedding backends. Implementations translate backend-specific
//! failure shapes into the shared `ProviderError` taxonomy; retry,
//! concurrency, and fallback are the pipeline's responsibility, not the
//! adapter's.

mod local;
mod remote;

pub use local::LocalProvider;
pub use remote::{RemoteProvider, RemoteProviderConfig};

use async_trait::async_trait;

use crate::errors::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    pub max_batch_size: usize,
    pub max_tokens_per_request: usize,
    pub requests_per_minute: u32,
}

#[async_trait]
pub trait EmbedProvider: Send + Sync {
    /// Stable identifier used in config, metadata stamps, and health tracking.
    fn provider_id(&self) -> &str;

    /// Model identifier the provider is currently configured for.
    fn model_id(&self) -> &str;

    /// Dimension of every vector this provider returns for its current model.
    fn dimension(&self) -> usize;

    fn limits(&self) -> ProviderLimits;

    /// Cheap readiness probe (e.g. has credentials); does not guarantee the
    /// next call will succeed.
    fn is_ready(&self) -> bool;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}
