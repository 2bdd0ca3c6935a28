//! Configuration (§6): the persisted JSON config shape plus the documented
//! environment-variable override layer. Env wins over the file; explicit
//! CLI flags (applied by `main.rs`) win over env.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            jitter: true,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub concurrent_requests: u32,
    pub retry: RetryConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 3000,
            concurrent_requests: 3,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub dimension: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
            api_key: None,
            base_url: None,
            model: "minishlab/potion-retrieval-32M".to_string(),
            dimension: 256,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub memory_limit_mb: usize,
    pub adaptive_batching: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_size: 16,
            memory_limit_mb: 256,
            adaptive_batching: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub max_file_size_bytes: u64,
    pub exclude_patterns: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 1_000_000,
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_provider: String,
    pub providers: HashMap<String, ProviderConfig>,
    pub performance: PerformanceConfig,
    pub indexing: IndexingConfig,
    /// Named repository sets for `query --scope set:<name>`, populated by the
    /// `sources` subcommand. Not part of the documented §6 schema proper, but
    /// it rides along in the same config file since it has nowhere else to live.
    pub sources: HashMap<String, Vec<PathBuf>>,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("local".to_string(), ProviderConfig::default());
        Self {
            default_provider: "local".to_string(),
            providers,
            performance: PerformanceConfig::default(),
            indexing: IndexingConfig::default(),
            sources: HashMap::new(),
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("codewell").join("config.json"))
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Self::apply_env(Self::default()),
        };
        let config = serde_json::from_str::<Config>(&text).unwrap_or_default();
        Self::apply_env(config)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "no config directory available"));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
    }

    /// Applies the documented environment-variable overrides on top of the
    /// file-derived config. Per-provider keys follow `<PROVIDER>_API_KEY`,
    /// `<PROVIDER>_BASE_URL`, `<PROVIDER>_MODEL` using the provider's name
    /// upper-cased.
    fn apply_env(mut config: Config) -> Config {
        if let Ok(v) = std::env::var("DEFAULT_PROVIDER") {
            config.default_provider = v;
        }
        if let Ok(v) = std::env::var("CONCURRENCY") {
            if let Ok(n) = v.parse() {
                config.performance.concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                config.performance.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("MEMORY_LIMIT_MB") {
            if let Ok(n) = v.parse() {
                config.performance.memory_limit_mb = n;
            }
        }
        for (name, provider) in config.providers.iter_mut() {
            let prefix = name.to_uppercase();
            if let Ok(v) = std::env::var(format!("{prefix}_API_KEY")) {
                provider.api_key = Some(v);
            }
            if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
                provider.base_url = Some(v);
            }
            if let Ok(v) = std::env::var(format!("{prefix}_MODEL")) {
                provider.model = v;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_local_provider() {
        let config = Config::default();
        assert_eq!(config.default_provider, "local");
        assert!(config.providers.contains_key("local"));
    }

    #[test]
    fn load_from_missing_file_falls_back_to_default() {
        let path = std::env::temp_dir().join("codewell-missing-config.json");
        let _ = std::fs::remove_file(&path);
        let config = Config::load_from(&path);
        assert_eq!(config.default_provider, "local");
    }

    #[test]
    fn load_from_malformed_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.default_provider, "local");
    }
}
