use crate::synthesizer::FilterTemplate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: String,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub pruning: PruningConfig,
    pub synthesis: SynthesisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub lru_capacity: usize,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    pub effectiveness_threshold: f64,
    pub usage_threshold: u64,
    pub age_threshold_days: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Replaces the built-in templates when present.
    pub templates: Option<Vec<FilterTemplate>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/smart-filter/filters.db".to_string(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            pruning: PruningConfig::default(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 250,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl StoreConfig {
    /// Delay before retry number `attempt` (1-based): base, 2*base, 4*base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lru_capacity: 1000,
            ttl_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            effectiveness_threshold: 0.3,
            usage_threshold: 10,
            age_threshold_days: 90,
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content).with_context(|| {
            format!("Failed to parse YAML config: {}", path.as_ref().display())
        })?;

        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => {
                log::info!("Loaded configuration from: {}", path.as_ref().display());
                config
            }
            Err(e) => {
                log::warn!("Failed to load config ({e:#}), using defaults");
                Self::default()
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pruning.effectiveness_threshold, 0.3);
        assert_eq!(config.pruning.usage_threshold, 10);
        assert_eq!(config.pruning.age_threshold_days, 90);
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.store.retry_attempts, 3);
        assert!(config.synthesis.templates.is_none());
    }

    #[test]
    fn test_backoff_is_exponential() {
        let store = StoreConfig::default();
        assert_eq!(store.backoff(1), Duration::from_millis(100));
        assert_eq!(store.backoff(2), Duration::from_millis(200));
        assert_eq!(store.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_path: /tmp/filters.db\npruning:\n  usage_threshold: 25\ncache:\n  lru_capacity: 16"
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.database_path, "/tmp/filters.db");
        assert_eq!(config.pruning.usage_threshold, 25);
        assert_eq!(config.pruning.effectiveness_threshold, 0.3);
        assert_eq!(config.cache.lru_capacity, 16);
        assert_eq!(config.cache.ttl_seconds, 300);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = EngineConfig::load_or_default("/nonexistent/smart-filter.yaml");
        assert_eq!(config.cache.lru_capacity, 1000);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = EngineConfig::default().to_yaml().unwrap();
        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.database_path, EngineConfig::default().database_path);
        assert_eq!(parsed.store.retry_base_delay_ms, 100);
    }
}
