use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::{
    cache::DEFAULT_MAX_DISTANCE_KM, circuit_breaker::CircuitBreakerConfig, provider::ProviderId,
    retry::RetryConfig,
};

/// Serialize a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a single provider (e.g., API key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
}

/// Caller-facing fetch settings, read afresh on every orchestrator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub enable_multi_provider: bool,
    pub primary_provider: ProviderId,
    /// Tried in order after the primary. Entries equal to the primary are ignored.
    pub fallback_order: Vec<ProviderId>,
    /// Per-attempt HTTP timeout.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            enable_multi_provider: true,
            primary_provider: ProviderId::OpenMeteo,
            fallback_order: vec![ProviderId::OpenWeather, ProviderId::WeatherApi],
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A cached reading further than this from the query point is ignored.
    pub max_distance_km: f64,
    /// Overrides the platform cache directory.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            dir: None,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// [providers.openweather]
/// api_key = "..."
///
/// [settings]
/// primary_provider = "openmeteo"
/// fallback_order = ["openweather", "weatherapi"]
/// timeout_ms = 8000
///
/// [retry_overrides.openweather]
/// max_retries = 0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: HashMap<String, ProviderConfig>,
    pub settings: WeatherSettings,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Keyed by provider id, e.g. `[retry_overrides.openweather]`.
    pub retry_overrides: HashMap<String, RetryConfig>,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            settings: WeatherSettings::default(),
            circuit_breaker: CircuitBreakerConfig::orchestrator_default(),
            retry: RetryConfig::default(),
            retry_overrides: HashMap::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn set_primary_provider(&mut self, id: ProviderId) {
        self.settings.primary_provider = id;
    }

    /// Retry policy for `id`: its override if present, else the global one.
    pub fn retry_for(&self, id: ProviderId) -> &RetryConfig {
        self.retry_overrides.get(id.as_str()).unwrap_or(&self.retry)
    }

    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "wxfetch", "wxfetch")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Set/replace a provider API key and make sure the provider takes part
    /// in the fallback chain.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers.insert(provider_id.as_str().to_string(), ProviderConfig { api_key });

        let settings = &mut self.settings;
        if settings.primary_provider != provider_id
            && !settings.fallback_order.contains(&provider_id)
        {
            settings.fallback_order.push(provider_id);
        }
    }

    /// Returns API key for a provider, if present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers.get(provider_id.as_str()).map(|cfg| cfg.api_key.as_str())
    }

    /// Keyless providers are always configured.
    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        !provider_id.requires_api_key() || self.provider_api_key(provider_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_keyless_primary() {
        let cfg = Config::default();

        assert!(cfg.settings.enable_multi_provider);
        assert_eq!(cfg.settings.primary_provider, ProviderId::OpenMeteo);
        assert_eq!(
            cfg.settings.fallback_order,
            vec![ProviderId::OpenWeather, ProviderId::WeatherApi]
        );
        assert_eq!(cfg.settings.timeout, Duration::from_secs(10));
        assert_eq!(cfg.circuit_breaker.recovery_time, Duration::from_secs(60));
        assert!(cfg.is_provider_configured(ProviderId::OpenMeteo));
        assert!(!cfg.is_provider_configured(ProviderId::OpenWeather));
    }

    #[test]
    fn set_api_key_for_provider() {
        let mut cfg = Config::default();

        cfg.upsert_provider_api_key(ProviderId::OpenWeather, "OPEN_KEY".into());

        let key = cfg.provider_api_key(ProviderId::OpenWeather);
        assert_eq!(key, Some("OPEN_KEY"));
        assert!(cfg.is_provider_configured(ProviderId::OpenWeather));
    }

    #[test]
    fn upsert_appends_to_fallback_order_once() {
        let mut cfg = Config::default();
        cfg.settings.fallback_order.clear();

        cfg.upsert_provider_api_key(ProviderId::WeatherApi, "A".into());
        cfg.upsert_provider_api_key(ProviderId::WeatherApi, "B".into());

        assert_eq!(cfg.settings.fallback_order, vec![ProviderId::WeatherApi]);
        assert_eq!(cfg.provider_api_key(ProviderId::WeatherApi), Some("B"));
    }

    #[test]
    fn upsert_does_not_add_primary_to_fallbacks() {
        let mut cfg = Config::default();
        cfg.set_primary_provider(ProviderId::OpenWeather);
        cfg.settings.fallback_order.clear();

        cfg.upsert_provider_api_key(ProviderId::OpenWeather, "KEY".into());

        assert!(cfg.settings.fallback_order.is_empty());
    }

    #[test]
    fn retry_overrides_apply_per_provider() {
        let cfg = Config::from_toml(
            r#"
            [retry]
            max_retries = 4

            [retry_overrides.openweather]
            max_retries = 0
            base_delay_ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(cfg.retry_for(ProviderId::OpenWeather).max_retries, 0);
        assert_eq!(
            cfg.retry_for(ProviderId::OpenWeather).base_delay,
            Duration::from_millis(100)
        );
        assert_eq!(cfg.retry_for(ProviderId::WeatherApi).max_retries, 4);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml(
            r#"
            [providers.weatherapi]
            api_key = "K"

            [settings]
            primary_provider = "weatherapi"
            timeout_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.settings.primary_provider, ProviderId::WeatherApi);
        assert_eq!(cfg.settings.timeout, Duration::from_millis(2500));
        assert!(cfg.settings.enable_multi_provider);
        assert_eq!(cfg.cache.max_distance_km, DEFAULT_MAX_DISTANCE_KM);
        assert_eq!(cfg.circuit_breaker, CircuitBreakerConfig::orchestrator_default());
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = Config::default();
        cfg.upsert_provider_api_key(ProviderId::OpenWeather, "KEY".into());

        let text = toml::to_string_pretty(&cfg).unwrap();
        let back = Config::from_toml(&text).unwrap();

        assert_eq!(back.settings, cfg.settings);
        assert_eq!(back.provider_api_key(ProviderId::OpenWeather), Some("KEY"));
    }
}
