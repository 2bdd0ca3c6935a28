//! Fallback Coordinator (C7): tracks per-provider health, enforces cooldown,
//! and walks an ordered fallback chain on escalation. Health state is owned
//! here as a standalone resource; the Dispatcher only reports outcomes and
//! never mutates it directly, avoiding the cyclic health/dispatcher
//! references the original design used.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{IndexError, ProviderError};
use crate::provider::EmbedProvider;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const RATE_LIMIT_MIN_COOLDOWN: Duration = Duration::from_secs(60);
const AUTH_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const RESPONSE_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub cooldown_until: Option<Instant>,
    pub response_times_ms: Vec<u64>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            cooldown_until: None,
            response_times_ms: Vec::new(),
        }
    }
}

pub struct FallbackCoordinator {
    providers: Vec<Arc<dyn EmbedProvider>>,
    health: RwLock<HashMap<String, ProviderHealth>>,
}

impl FallbackCoordinator {
    pub fn new(providers: Vec<Arc<dyn EmbedProvider>>) -> Self {
        let mut health = HashMap::new();
        for p in &providers {
            health.insert(p.provider_id().to_string(), ProviderHealth::default());
        }
        Self {
            providers,
            health: RwLock::new(health),
        }
    }

    pub fn health_of(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.health.read().unwrap().get(provider_id).cloned()
    }

    fn is_eligible(&self, provider_id: &str, now: Instant) -> bool {
        let health = self.health.read().unwrap();
        match health.get(provider_id) {
            None => true,
            Some(h) => {
                let in_cooldown = h.cooldown_until.is_some_and(|until| now < until);
                !in_cooldown && h.consecutive_failures < MAX_CONSECUTIVE_FAILURES
            }
        }
    }

    fn record_success(&self, provider_id: &str, latency: Duration) {
        let mut health = self.health.write().unwrap();
        let entry = health.entry(provider_id.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.consecutive_successes += 1;
        entry.healthy = true;
        entry.response_times_ms.push(latency.as_millis() as u64);
        if entry.response_times_ms.len() > RESPONSE_WINDOW {
            entry.response_times_ms.remove(0);
        }
    }

    fn record_failure(&self, provider_id: &str, error: &ProviderError, now: Instant) {
        let mut health = self.health.write().unwrap();
        let entry = health.entry(provider_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.consecutive_successes = 0;
        entry.cooldown_until = match error {
            ProviderError::RateLimit { retry_after_ms } => {
                let requested = retry_after_ms.map(Duration::from_millis).unwrap_or_default();
                Some(now + requested.max(RATE_LIMIT_MIN_COOLDOWN))
            }
            ProviderError::Auth => Some(now + AUTH_COOLDOWN),
            _ => entry.cooldown_until,
        };
        if entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            entry.healthy = false;
            warn!(provider_id, "provider marked unhealthy after {} consecutive failures", entry.consecutive_failures);
        }
    }

    /// Walks the configured providers in order, skipping ones in cooldown or
    /// with too many consecutive failures, until one succeeds or all are
    /// exhausted.
    pub async fn dispatch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, String, String), IndexError> {
        let mut attempted = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let now = Instant::now();

        for provider in &self.providers {
            let id = provider.provider_id();
            if !self.is_eligible(id, now) {
                debug!(provider_id = id, "skipping provider: in cooldown or unhealthy");
                continue;
            }
            attempted.push(id.to_string());
            let started = Instant::now();
            match provider.embed(texts).await {
                Ok(vectors) => {
                    self.record_success(id, started.elapsed());
                    return Ok((vectors, id.to_string(), provider.model_id().to_string()));
                }
                Err(e) => {
                    self.record_failure(id, &e, now);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => IndexError::AllProvidersFailed {
                attempted,
                last: Box::new(e),
            },
            None => IndexError::configuration("no embedding providers configured or all in cooldown"),
        })
    }

    /// Re-invokes `provider_id` directly, bypassing the cooldown/health
    /// eligibility check `dispatch`'s ordered walk applies. The Dispatcher's
    /// own retry loop (§4.6) needs this: a `RateLimit` failure makes
    /// `dispatch` put the very provider it just tried into cooldown, so a
    /// second call to `dispatch` would never retry it — it would just see it
    /// as ineligible and report every provider exhausted.
    pub async fn retry_provider(
        &self,
        provider_id: &str,
        texts: &[String],
    ) -> Result<(Vec<Vec<f32>>, String), ProviderError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.provider_id() == provider_id)
            .ok_or_else(|| ProviderError::Provider {
                message: format!("unknown provider \"{provider_id}\""),
            })?;
        let started = Instant::now();
        match provider.embed(texts).await {
            Ok(vectors) => {
                self.record_success(provider_id, started.elapsed());
                Ok((vectors, provider.model_id().to_string()))
            }
            Err(e) => {
                self.record_failure(provider_id, &e, Instant::now());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::ScriptedProvider;

    #[tokio::test]
    async fn succeeds_on_primary_when_healthy() {
        let primary = Arc::new(ScriptedProvider::new("primary", 2, vec![]));
        let coordinator = FallbackCoordinator::new(vec![primary]);
        let (vectors, id, _) = coordinator.dispatch(&["x".to_string()]).await.unwrap();
        assert_eq!(id, "primary");
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_on_auth_failure() {
        let primary = Arc::new(ScriptedProvider::new("primary", 2, vec![ProviderError::Auth]));
        let secondary = Arc::new(ScriptedProvider::new("secondary", 4, vec![]));
        let coordinator = FallbackCoordinator::new(vec![primary, secondary]);
        let (vectors, id, _) = coordinator.dispatch(&["x".to_string()]).await.unwrap();
        assert_eq!(id, "secondary");
        assert_eq!(vectors[0].len(), 4);

        let health = coordinator.health_of("primary").unwrap();
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn all_providers_failing_is_terminal() {
        let primary = Arc::new(ScriptedProvider::new("primary", 2, vec![ProviderError::Auth]));
        let coordinator = FallbackCoordinator::new(vec![primary]);
        let result = coordinator.dispatch(&["x".to_string()]).await;
        assert!(matches!(result, Err(IndexError::AllProvidersFailed { .. })));
    }

    #[tokio::test]
    async fn unhealthy_provider_is_skipped_after_three_failures() {
        let primary = Arc::new(ScriptedProvider::new(
            "primary",
            2,
            vec![ProviderError::Provider { message: "x".into() }; 3],
        ));
        let coordinator = FallbackCoordinator::new(vec![primary]);
        for _ in 0..3 {
            let _ = coordinator.dispatch(&["x".to_string()]).await;
        }
        let health = coordinator.health_of("primary").unwrap();
        assert!(!health.healthy);
    }
}
