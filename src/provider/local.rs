//! Local static-embedding provider backed by `model2vec-rs` — no network
//! call, no ONNX runtime, just a downloaded model directory.

use async_trait::async_trait;
use model2vec_rs::model::StaticModel;

use super::{EmbedProvider, ProviderLimits};
use crate::errors::ProviderError;

pub struct LocalProvider {
    provider_id: String,
    model_id: String,
    dimension: usize,
    model: StaticModel,
}

impl LocalProvider {
    pub fn load(provider_id: &str, model_id: &str) -> Result<Self, ProviderError> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| ProviderError::Provider { message: e.to_string() })?;
        let dimension = model.encode_single("probe").len();
        Ok(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            dimension,
            model,
        })
    }
}

#[async_trait]
impl EmbedProvider for LocalProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn limits(&self) -> ProviderLimits {
        // No network round trip; batch size is bounded only by available
        // memory, but we cap it generously to keep pipeline sizing sane.
        ProviderLimits {
            max_batch_size: 256,
            max_tokens_per_request: usize::MAX,
            requests_per_minute: u32::MAX,
        }
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.model.encode_single(t)).collect())
    }
}
