//! Remote HTTP embedding provider: `POST {base_url}/embeddings` with
//! `{ model, input: [texts...] }`, expecting `{ data: [{ embedding: [...] }] }`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EmbedProvider, ProviderLimits};
use crate::errors::ProviderError;

#[derive(Debug, Clone)]
pub struct RemoteProviderConfig {
    pub provider_id: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    pub max_batch_size: usize,
    pub max_tokens_per_request: usize,
    pub requests_per_minute: u32,
    pub request_timeout: Duration,
}

pub struct RemoteProvider {
    config: RemoteProviderConfig,
    client: reqwest::Client,
}

impl RemoteProvider {
    pub fn new(config: RemoteProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbedProvider for RemoteProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_batch_size: self.config.max_batch_size,
            max_tokens_per_request: self.config.max_tokens_per_request,
            requests_per_minute: self.config.requests_per_minute,
        }
    }

    fn is_ready(&self) -> bool {
        self.config.api_key.as_deref().is_some_or(|k| !k.is_empty())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingsRequest {
            model: &self.config.model,
            input: texts,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(ProviderError::from)?;

        if response.status().as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(ProviderError::RateLimit { retry_after_ms });
        }
        if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            return Err(ProviderError::Auth);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Provider {
                message: format!("http {}", response.status()),
            });
        }

        let parsed: EmbeddingsResponse = response.json().await.map_err(ProviderError::from)?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ready_requires_a_non_empty_api_key() {
        let cfg = RemoteProviderConfig {
            provider_id: "openai".into(),
            base_url: "https://api.example.com".into(),
            api_key: None,
            model: "m".into(),
            dimension: 1536,
            max_batch_size: 64,
            max_tokens_per_request: 8192,
            requests_per_minute: 3000,
            request_timeout: Duration::from_secs(60),
        };
        let provider = RemoteProvider::new(cfg);
        assert!(!provider.is_ready());
    }
}
