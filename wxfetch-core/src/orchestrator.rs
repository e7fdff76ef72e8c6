//! Cache-first, circuit-gated, retrying fallback chain over weather providers.
//!
//! A call resolves to exactly one of two outcomes: a reading (fresh from a
//! provider, or from cache with its freshness and age attached) or a single
//! `ALL_PROVIDERS_FAILED` error. Provider errors never escape while a
//! fallback or a usable cache remains.

use anyhow::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    iter,
    sync::Arc,
};

use crate::{
    Config,
    cache::{
        CacheManager, CachedWeather, DEFAULT_MAX_DISTANCE_KM, Freshness,
        should_refresh_in_background,
    },
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState},
    config::WeatherSettings,
    elevation::ElevationLookup,
    error::{ErrorCode, WeatherError},
    model::NormalizedWeather,
    provider::{
        ProviderId, WeatherProvider, open_meteo::OpenMeteoProvider, providers_from_config,
    },
    retry::{RetryConfig, with_retry},
    store::{FileStore, KeyValueStore},
};

/// Provider used by the single-provider path of [`WeatherOrchestrator::fetch_weather`].
pub const DIRECT_PROVIDER: ProviderId = ProviderId::OpenMeteo;

/// Outcome of a fallback fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub weather: NormalizedWeather,
    pub from_cache: bool,
    /// Set when the reading came from cache.
    pub freshness: Option<Freshness>,
    pub cache_age_minutes: Option<i64>,
    pub providers_attempted: Vec<ProviderId>,
    pub warnings: Vec<String>,
}

impl FetchResult {
    fn live(
        weather: NormalizedWeather,
        providers_attempted: Vec<ProviderId>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            weather,
            from_cache: false,
            freshness: None,
            cache_age_minutes: None,
            providers_attempted,
            warnings,
        }
    }

    fn cached(
        hit: CachedWeather,
        providers_attempted: Vec<ProviderId>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            cache_age_minutes: Some(hit.age_minutes()),
            freshness: Some(hit.freshness),
            weather: hit.weather,
            from_cache: true,
            providers_attempted,
            warnings,
        }
    }

    /// Whether the caller should kick off a refresh after serving this result.
    pub fn needs_background_refresh(&self) -> bool {
        self.freshness.is_some_and(should_refresh_in_background)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub state: CircuitState,
    pub configured: bool,
}

#[derive(Debug)]
pub struct WeatherOrchestrator {
    providers: HashMap<ProviderId, Arc<dyn WeatherProvider>>,
    elevation: Arc<dyn ElevationLookup>,
    circuits: CircuitBreakerRegistry,
    circuit_config: CircuitBreakerConfig,
    cache: CacheManager<Arc<dyn KeyValueStore>>,
    retry: RetryConfig,
    retry_overrides: HashMap<ProviderId, RetryConfig>,
    max_distance_km: f64,
}

impl WeatherOrchestrator {
    pub fn new(
        providers: Vec<Arc<dyn WeatherProvider>>,
        elevation: Arc<dyn ElevationLookup>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id(), p)).collect(),
            elevation,
            circuits: CircuitBreakerRegistry::new(),
            circuit_config: CircuitBreakerConfig::orchestrator_default(),
            cache: CacheManager::new(store),
            retry: RetryConfig::default(),
            retry_overrides: HashMap::new(),
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
        }
    }

    /// Wire up real adapters, the Open-Meteo elevation source and the
    /// on-disk cache from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = match &config.cache.dir {
            Some(dir) => FileStore::new(dir),
            None => FileStore::in_default_location()?,
        };
        store.ensure_dir().context("Failed to prepare weather cache")?;

        let mut orchestrator = Self::new(
            providers_from_config(config),
            Arc::new(OpenMeteoProvider::new()),
            Arc::new(store),
        )
        .with_circuit_config(config.circuit_breaker.clone())
        .with_retry_config(config.retry.clone())
        .with_max_distance_km(config.cache.max_distance_km);

        for key in config.retry_overrides.keys() {
            match ProviderId::try_from(key.as_str()) {
                Ok(id) => {
                    let retry = config.retry_for(id).clone();
                    orchestrator = orchestrator.with_provider_retry(id, retry);
                }
                Err(err) => tracing::warn!(error = %err, "ignoring retry override"),
            }
        }

        Ok(orchestrator)
    }

    pub fn with_circuit_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_config = config;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_provider_retry(mut self, provider: ProviderId, config: RetryConfig) -> Self {
        self.retry_overrides.insert(provider, config);
        self
    }

    pub fn with_max_distance_km(mut self, max_distance_km: f64) -> Self {
        self.max_distance_km = max_distance_km;
        self
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    pub fn circuit_config(&self) -> &CircuitBreakerConfig {
        &self.circuit_config
    }

    pub fn cache(&self) -> &CacheManager<Arc<dyn KeyValueStore>> {
        &self.cache
    }

    fn retry_for(&self, provider: ProviderId) -> &RetryConfig {
        self.retry_overrides.get(&provider).unwrap_or(&self.retry)
    }

    /// Primary first, then fallbacks in order. Duplicates, providers without
    /// an adapter and providers whose circuit refuses are left out.
    ///
    /// Every candidate's circuit is consulted before any attempt is made, so
    /// an open circuit past its cooldown moves to half-open here even if an
    /// earlier provider then succeeds. Its trial request then happens on a later call.
    fn candidate_order(&self, settings: &WeatherSettings) -> Vec<ProviderId> {
        let primary = settings.primary_provider;
        let fallbacks: &[ProviderId] = if settings.enable_multi_provider {
            &settings.fallback_order
        } else {
            &[]
        };

        let mut order = Vec::with_capacity(fallbacks.len() + 1);
        for id in iter::once(primary).chain(fallbacks.iter().copied()) {
            if order.contains(&id) {
                continue;
            }
            if !self.providers.contains_key(&id) {
                tracing::debug!(provider = %id, "provider not configured, skipping");
                continue;
            }
            if !self.circuits.can_request(id, &self.circuit_config) {
                let retry_in = self.circuits.time_until_retry(id, &self.circuit_config);
                tracing::debug!(
                    provider = %id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "circuit open, skipping"
                );
                continue;
            }
            order.push(id);
        }
        order
    }

    /// Fetch current conditions at (`lat`, `lon`).
    ///
    /// 1. A fresh cache hit at this location is returned without any I/O.
    /// 2. Elevation is taken from the cached reading when known, otherwise
    ///    looked up once.
    /// 3. Providers are tried in order, each under its retry policy. The first
    ///    success is recorded, cached and returned.
    /// 4. With every candidate failed or circuit-blocked, a usable cache is
    ///    returned with warnings; otherwise `ALL_PROVIDERS_FAILED`.
    pub async fn fetch_weather_with_fallback(
        &self,
        lat: f64,
        lon: f64,
        settings: &WeatherSettings,
    ) -> Result<FetchResult, WeatherError> {
        let cached = self
            .cache
            .get_cached_weather(Some((lat, lon)), self.max_distance_km);

        if let Some(hit) = &cached {
            if hit.freshness == Freshness::Fresh {
                tracing::debug!(age_minutes = hit.age_minutes(), "serving fresh cached weather");
                return Ok(FetchResult::cached(hit.clone(), Vec::new(), Vec::new()));
            }
        }

        let elevation_ft = match cached.as_ref().and_then(|hit| hit.weather.altitude_ft) {
            Some(ft) => Some(ft),
            None => self.elevation.get_elevation(lat, lon).await,
        };

        let candidates = self.candidate_order(settings);
        if candidates.is_empty() {
            tracing::warn!("no weather provider is currently available");
            return match cached.filter(CachedWeather::is_usable) {
                Some(hit) => {
                    let warning = format!(
                        "All weather providers are temporarily unavailable; \
                         using cached data from {} minutes ago",
                        hit.age_minutes()
                    );
                    Ok(FetchResult::cached(hit, Vec::new(), vec![warning]))
                }
                None => Err(WeatherError::all_providers_failed(
                    "All weather providers are temporarily unavailable \
                     and no usable cached data exists",
                )),
            };
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        let mut warnings = Vec::new();

        for id in candidates {
            let Some(provider) = self.providers.get(&id) else {
                continue;
            };
            let provider: &dyn WeatherProvider = provider.as_ref();
            let timeout = settings.timeout;
            attempted.push(id);

            let outcome = with_retry(self.retry_for(id), move || {
                provider.fetch(lat, lon, elevation_ft, timeout)
            })
            .await;

            match outcome {
                Ok(weather) => {
                    self.circuits.record_success(id, &self.circuit_config);
                    self.cache.cache_weather(&weather);
                    tracing::info!(
                        provider = %id,
                        attempted = attempted.len(),
                        "weather fetched"
                    );
                    return Ok(FetchResult::live(weather, attempted, warnings));
                }
                Err(err) => {
                    self.circuits.record_failure(id, &self.circuit_config);
                    tracing::warn!(provider = %id, error = %err, "provider failed");
                    warnings.push(format!("{id} failed: {err}"));
                }
            }
        }

        match cached.filter(CachedWeather::is_usable) {
            Some(hit) => {
                warnings.push(format!(
                    "All providers failed; using cached data from {} minutes ago",
                    hit.age_minutes()
                ));
                Ok(FetchResult::cached(hit, attempted, warnings))
            }
            None => Err(WeatherError::all_providers_failed(format!(
                "All weather providers failed: {}",
                warnings.join("; ")
            ))),
        }
    }

    /// Simplified entry point.
    ///
    /// Without multi-provider support the fixed [`DIRECT_PROVIDER`] is called
    /// directly, bypassing circuit breakers and fallback, and its reading is
    /// cached. With it, this delegates to
    /// [`fetch_weather_with_fallback`](Self::fetch_weather_with_fallback) and
    /// logs any warnings.
    pub async fn fetch_weather(
        &self,
        lat: f64,
        lon: f64,
        use_multi_provider: bool,
        settings: Option<&WeatherSettings>,
    ) -> Result<NormalizedWeather, WeatherError> {
        let settings = settings.cloned().unwrap_or_default();

        if !use_multi_provider {
            let provider = self.providers.get(&DIRECT_PROVIDER).ok_or_else(|| {
                WeatherError::new(
                    ErrorCode::NetworkError,
                    format!("{DIRECT_PROVIDER}: no weather data available"),
                )
                .with_provider(DIRECT_PROVIDER)
            })?;

            let weather = provider.fetch(lat, lon, None, settings.timeout).await?;
            self.cache.cache_weather(&weather);
            return Ok(weather);
        }

        let result = self.fetch_weather_with_fallback(lat, lon, &settings).await?;
        for warning in &result.warnings {
            tracing::warn!(%warning, "weather fetch warning");
        }
        Ok(result.weather)
    }

    /// Diagnostic snapshot of every known provider. Never consulted by the
    /// fetch path.
    pub fn provider_status(&self) -> BTreeMap<ProviderId, ProviderStatus> {
        ProviderId::all()
            .iter()
            .map(|id| {
                (
                    *id,
                    ProviderStatus {
                        state: self.circuits.state(*id),
                        configured: self.providers.contains_key(id),
                    },
                )
            })
            .collect()
    }
}
